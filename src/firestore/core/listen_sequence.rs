pub type ListenSequenceNumber = i64;

/// Sequence numbers order target and document accesses for LRU garbage
/// collection. Every client sharing a cache advances the same counter.
#[derive(Clone, Debug)]
pub struct ListenSequence {
    previous: ListenSequenceNumber,
}

impl ListenSequence {
    pub const INVALID: ListenSequenceNumber = -1;

    pub fn new(previous: ListenSequenceNumber) -> Self {
        Self { previous }
    }

    pub fn current(&self) -> ListenSequenceNumber {
        self.previous
    }

    /// Catches up with a value written by another client.
    pub fn observe(&mut self, external: ListenSequenceNumber) -> ListenSequenceNumber {
        self.previous = self.previous.max(external);
        self.previous
    }

    pub fn next(&mut self) -> ListenSequenceNumber {
        self.previous += 1;
        self.previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_goes_backwards() {
        let mut sequence = ListenSequence::new(5);
        assert_eq!(sequence.next(), 6);
        assert_eq!(sequence.observe(3), 6);
        assert_eq!(sequence.observe(10), 10);
        assert_eq!(sequence.next(), 11);
    }
}
