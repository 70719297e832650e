use rand::Rng;

pub trait Shuffling: Iterator {
    /// Shuffles within a window of `max_elements_to_buffer` items, so the whole
    /// dataset never needs to be in memory.
    fn shuffling<R: Rng>(self, max_elements_to_buffer: usize, rng: R) -> Shuffler<Self, R>
    where
        Self: Sized,
    {
        Shuffler {
            iterator: self,
            max_elements_to_buffer: max_elements_to_buffer.max(1),
            buffer: vec![],
            rng,
        }
    }
}

pub struct Shuffler<T: Iterator, R> {
    iterator: T,
    max_elements_to_buffer: usize,
    buffer: Vec<T::Item>,
    rng: R,
}

impl<T: Iterator, R: Rng> Iterator for Shuffler<T, R> {
    type Item = T::Item;

    fn next(&mut self) -> Option<Self::Item> {
        self.fill_buffer();
        if self.buffer.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..self.buffer.len());
        Some(self.buffer.swap_remove(index))
    }
}

impl<T: Iterator, R> Shuffler<T, R> {
    fn fill_buffer(&mut self) {
        while self.buffer.len() < self.max_elements_to_buffer {
            match self.iterator.next() {
                None => break,
                Some(element) => self.buffer.push(element),
            }
        }
    }
}

impl<T: ?Sized> Shuffling for T where T: Iterator {}
