use num_integer::Integer;

/// Invalid-page bitmap of a block: bit set = page superseded.
#[derive(Debug, Clone)]
pub struct InvalidBitmap {
    words: Vec<u64>,
    len: usize,
}

impl InvalidBitmap {
    pub fn new(len: usize) -> Self {
        InvalidBitmap {
            words: vec![0; Integer::div_ceil(&len, &64)],
            len,
        }
    }

    #[inline]
    fn locate(idx: usize) -> (usize, u64) {
        let (word, bit) = idx.div_rem(&64);
        (word, 1u64 << bit)
    }

    pub fn get(&self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        let (word, mask) = Self::locate(idx);
        self.words[word] & mask != 0
    }

    /// Sets bit `idx`, returning whether it was already set.
    pub fn test_and_set(&mut self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        let (word, mask) = Self::locate(idx);
        let was_set = self.words[word] & mask != 0;
        self.words[word] |= mask;
        was_set
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count_ones() == self.len
    }

    pub fn first_zero_from(&self, start: usize) -> Option<usize> {
        (start..self.len).find(|&idx| !self.get(idx))
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }
}
