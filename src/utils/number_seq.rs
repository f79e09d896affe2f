/// Bounded window of samples with a decaying average on top.
///
/// Used for marking-step timings and for predicting how much a step overruns its budget.
pub struct TruncatedSeq {
    num: usize,
    sum: f64,
    sum_of_squares: f64,
    davg: f64,
    dvariance: f64,
    alpha: f64,
    sequence: Box<[f64]>,
    next: usize,
}

impl TruncatedSeq {
    pub const DEFAULT_ALPHA: f64 = 0.7;

    pub fn new(length: usize, alpha: f64) -> Self {
        assert!(length > 0, "sequence length must be positive");
        Self {
            num: 0,
            sum: 0.0,
            sum_of_squares: 0.0,
            davg: 0.0,
            dvariance: 0.0,
            alpha,
            sequence: vec![0.0; length].into_boxed_slice(),
            next: 0,
        }
    }

    pub fn add(&mut self, val: f64) {
        if self.num == 0 {
            self.davg = val;
            self.dvariance = 0.0;
        } else {
            let diff = val - self.davg;
            let incr = self.alpha * diff;
            self.davg += incr;
            self.dvariance = (1.0 - self.alpha) * (self.dvariance + diff * incr);
        }

        let evicted = self.sequence[self.next];
        self.sum += val - evicted;
        self.sum_of_squares += val * val - evicted * evicted;
        self.sequence[self.next] = val;
        self.next = (self.next + 1) % self.sequence.len();

        if self.num < self.sequence.len() {
            self.num += 1;
        }
    }

    pub fn num(&self) -> usize {
        self.num
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn avg(&self) -> f64 {
        if self.num == 0 {
            0.0
        } else {
            self.sum / self.num as f64
        }
    }

    pub fn variance(&self) -> f64 {
        if self.num == 0 {
            return 0.0;
        }
        (self.sum_of_squares / self.num as f64 - self.avg() * self.avg()).max(0.0)
    }

    pub fn sd(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn davg(&self) -> f64 {
        self.davg
    }

    pub fn dsd(&self) -> f64 {
        if self.num <= 1 {
            return 0.0;
        }
        self.dvariance.max(0.0).sqrt()
    }

    pub fn maximum(&self) -> f64 {
        self.sequence[..self.num]
            .iter()
            .copied()
            .fold(0.0f64, f64::max)
    }

    pub fn last(&self) -> f64 {
        if self.num == 0 {
            0.0
        } else {
            self.sequence[(self.next + self.sequence.len() - 1) % self.sequence.len()]
        }
    }

    /// Decaying average plus one decaying standard deviation, never negative.
    pub fn predict_zero_bounded(&self) -> f64 {
        (self.davg() + self.dsd()).max(0.0)
    }
}
