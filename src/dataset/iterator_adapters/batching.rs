pub trait DatasetBatching: Iterator {
    /// Groups the items in batches of `batch_size`. The last batch may be smaller.
    fn dataset_batching(self, batch_size: usize) -> Batcher<Self>
    where
        Self: Sized,
    {
        assert!(batch_size > 0, "batch_size must not be zero");
        Batcher {
            iterator: self,
            batch_size,
        }
    }
}

pub struct Batcher<T: Iterator> {
    iterator: T,
    batch_size: usize,
}

impl<T: Iterator> Iterator for Batcher<T> {
    type Item = Vec<T::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let output: Vec<_> = self.iterator.by_ref().take(self.batch_size).collect();
        if output.is_empty() {
            None
        } else {
            Some(output)
        }
    }
}

impl<T: ?Sized> DatasetBatching for T where T: Iterator {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_test() {
        let elements = [0, 1, 2, 3, 4];
        let batches: Vec<Vec<_>> = elements.iter().copied().dataset_batching(2).collect();
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn empty_input_makes_no_batch() {
        assert_eq!(std::iter::empty::<u8>().dataset_batching(3).count(), 0);
    }
}
