use std::mem::size_of;

pub mod bitmap;
pub mod env;
pub mod number_seq;

pub const BITS_PER_WORD: usize = size_of::<usize>() * 8;

pub const fn nth_bit(n: usize) -> usize {
    if n >= BITS_PER_WORD {
        0
    } else {
        1 << n
    }
}

pub const fn right_nth_bit(n: usize) -> usize {
    nth_bit(n).wrapping_sub(1)
}

pub struct FormattedSize {
    pub size: f64,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = self.size / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 8f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

impl std::fmt::Debug for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size: size as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatted_size() {
        assert_eq!(formatted_size(512).to_string(), "512B");
        assert_eq!(formatted_size(4096).to_string(), "4.0K");
        assert_eq!(formatted_size(3 * 1024 * 1024).to_string(), "3.0M");
        assert_eq!(formatted_size(16 * 1024 * 1024 * 1024).to_string(), "16.0G");
    }

    #[test]
    fn test_bits() {
        assert_eq!(nth_bit(3), 8);
        assert_eq!(nth_bit(BITS_PER_WORD), 0);
        assert_eq!(right_nth_bit(4), 0b1111);
    }
}
