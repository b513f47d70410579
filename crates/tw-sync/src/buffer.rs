/// Holds high-frequency atoms and releases them in fixed-size batches.
#[derive(Debug, Clone)]
pub struct EventBuffer<T> {
    held: Vec<T>,
    batch_size: usize,
}

impl<T> EventBuffer<T> {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            held: Vec::with_capacity(batch_size),
            batch_size,
        }
    }

    /// Returns the full batch, oldest first, once the threshold is reached.
    pub fn push(&mut self, atom: T) -> Option<Vec<T>> {
        self.held.push(atom);
        if self.held.len() >= self.batch_size {
            let batch = std::mem::replace(&mut self.held, Vec::with_capacity(self.batch_size));
            return Some(batch);
        }
        None
    }

    pub fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.held)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    #[cfg(test)]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}
