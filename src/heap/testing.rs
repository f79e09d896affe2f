//! Synthetic heaps for tests: an object model backed by a side table and a heap whose
//! memory is never actually mapped.

use std::{collections::HashMap, sync::Arc};

use parking_lot::{Mutex, RwLock};

use super::{
    heap::Heap,
    object_model::ObjectModel,
    options::HeapOptions,
    region::RegionKind,
    virtual_memory::NoopMapper,
    words_to_bytes,
};

pub const TEST_HEAP_START: usize = 0x4000_0000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Clone, Debug)]
pub struct TestObject {
    pub words: usize,
    pub refs: Vec<usize>,
    pub is_array: bool,
}

/// Objects are described in a map keyed by address; heap memory is never read.
#[derive(Default)]
pub struct TestModel {
    objects: RwLock<HashMap<usize, TestObject>>,
    fillers: Mutex<Vec<(usize, usize)>>,
}

impl TestModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, addr: usize, object: TestObject) {
        self.objects.write().insert(addr, object);
    }

    pub fn set_refs(&self, addr: usize, refs: Vec<usize>) {
        if let Some(object) = self.objects.write().get_mut(&addr) {
            object.refs = refs;
        }
    }

    pub fn object(&self, addr: usize) -> Option<TestObject> {
        self.objects.read().get(&addr).cloned()
    }

    pub fn fillers(&self) -> Vec<(usize, usize)> {
        self.fillers.lock().clone()
    }
}

impl ObjectModel for TestModel {
    fn size_in_words(&self, obj: usize) -> usize {
        if let Some(object) = self.objects.read().get(&obj) {
            return object.words;
        }
        match self.fillers.lock().iter().find(|(start, _)| *start == obj) {
            Some(&(_, words)) => words,
            None => panic!("no object at {:#x}", obj),
        }
    }

    fn trace(&self, obj: usize, visitor: &mut dyn FnMut(usize)) {
        let refs = match self.objects.read().get(&obj) {
            Some(object) => object.refs.clone(),
            None => return,
        };
        for r in refs {
            visitor(r);
        }
    }

    fn ref_array_length(&self, obj: usize) -> Option<usize> {
        self.objects
            .read()
            .get(&obj)
            .filter(|object| object.is_array)
            .map(|object| object.refs.len())
    }

    fn trace_array_range(&self, obj: usize, from: usize, to: usize, visitor: &mut dyn FnMut(usize)) {
        let refs = match self.objects.read().get(&obj) {
            Some(object) => object.refs[from..to].to_vec(),
            None => return,
        };
        for r in refs {
            visitor(r);
        }
    }

    fn may_contain_references(&self, obj: usize) -> bool {
        self.objects
            .read()
            .get(&obj)
            .map_or(false, |object| object.is_array || !object.refs.is_empty())
    }

    fn fill_with_dummy_object(&self, start: usize, words: usize) {
        self.fillers.lock().push((start, words));
    }
}

pub struct TestHeap {
    pub heap: Arc<Heap>,
    pub model: Arc<TestModel>,
}

impl TestHeap {
    /// A heap of `regions` regions of `region_size` bytes, none committed yet.
    pub fn new(regions: usize, region_size: usize) -> Self {
        init_logging();
        let options = HeapOptions::setup_sizes(regions * region_size, Some(region_size));
        let model = Arc::new(TestModel::new());
        let heap = Arc::new(Heap::with_mapper(
            options,
            TEST_HEAP_START,
            Arc::new(NoopMapper::new()),
            model.clone(),
        ));
        Self { heap, model }
    }

    /// Like [`TestHeap::new`] with every region committed.
    pub fn committed(regions: usize, region_size: usize) -> Self {
        let test_heap = Self::new(regions, region_size);
        test_heap.heap.regions().expand_by(regions);
        test_heap
    }

    fn old_region(&self, index: usize) -> &super::region::HeapRegion {
        let regions = self.heap.regions();
        match regions.allocate_free_region_at(index) {
            Some(region) => {
                region.set_kind(RegionKind::Old);
                region
            }
            None => {
                let region = self.heap.table().at(index);
                assert_eq!(region.kind(), RegionKind::Old, "region {} is not usable", index);
                region
            }
        }
    }

    /// Allocates an object of `words` words in region `index`.
    pub fn alloc_in(&self, index: usize, words: usize, refs: Vec<usize>) -> usize {
        self.alloc_object(index, words, refs, false)
    }

    /// Allocates a reference array with one word per element plus a header word.
    pub fn alloc_array_in(&self, index: usize, refs: Vec<usize>) -> usize {
        let words = refs.len() + 1;
        self.alloc_object(index, words, refs, true)
    }

    fn alloc_object(&self, index: usize, words: usize, refs: Vec<usize>, is_array: bool) -> usize {
        let region = self.old_region(index);
        let (addr, allocated) = region
            .par_allocate(words, words, 1)
            .unwrap_or_else(|| panic!("region {} is full", index));
        assert_eq!(allocated, words);
        self.model.insert(
            addr,
            TestObject {
                words,
                refs,
                is_array,
            },
        );
        addr
    }

    pub fn set_refs(&self, obj: usize, refs: Vec<usize>) {
        self.model.set_refs(obj, refs);
    }

    pub fn size_in_bytes(&self, obj: usize) -> usize {
        words_to_bytes(self.model.size_in_words(obj))
    }
}
