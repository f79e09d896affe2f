/// Layout knowledge the marking engine needs about objects.
///
/// The engine never reads object memory itself. Everything it learns about an object
/// (its size and the references it holds) comes through this trait, so the object format
/// stays with the embedder.
pub trait ObjectModel: Send + Sync {
    /// Size of the object starting at `obj`, in heap words.
    fn size_in_words(&self, obj: usize) -> usize;

    /// Calls `visitor` with every non-null reference held by `obj`.
    ///
    /// For reference arrays that report a length through [`ObjectModel::ref_array_length`]
    /// the engine calls [`ObjectModel::trace_array_range`] instead.
    fn trace(&self, obj: usize, visitor: &mut dyn FnMut(usize));

    /// Element count when `obj` is an array of references.
    fn ref_array_length(&self, obj: usize) -> Option<usize> {
        let _ = obj;
        None
    }

    /// Visits the non-null references in elements `[from, to)` of the reference array `obj`.
    fn trace_array_range(&self, obj: usize, from: usize, to: usize, visitor: &mut dyn FnMut(usize)) {
        let _ = (obj, from, to, visitor);
    }

    /// Objects that can never hold references are marked and counted but not queued.
    fn may_contain_references(&self, obj: usize) -> bool {
        let _ = obj;
        true
    }

    /// Formats `[start, start + words)` as a dead object so the range stays parsable.
    fn fill_with_dummy_object(&self, start: usize, words: usize);

    /// Smallest range [`ObjectModel::fill_with_dummy_object`] can format.
    fn min_filler_words(&self) -> usize {
        2
    }
}
