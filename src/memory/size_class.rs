/// Number of pooled size classes.
pub const NUM_SIZE_CLASSES: usize = 12;

/// Granularity of the lookup table; every size class is a multiple of it.
pub const SIZE_QUANTUM: usize = 8;

/// Default ladder: `8 << i` for `i in 0..12`, i.e. 8 B .. 16 KiB.
pub const DEFAULT_SIZE_CLASSES: [usize; NUM_SIZE_CLASSES] = build_default_ladder();

const fn build_default_ladder() -> [usize; NUM_SIZE_CLASSES] {
    let mut ladder = [0usize; NUM_SIZE_CLASSES];
    let mut i = 0;
    while i < NUM_SIZE_CLASSES {
        ladder[i] = SIZE_QUANTUM << i;
        i += 1;
    }
    ladder
}

/// Maps request sizes to size-class indices.
///
/// The ladder is fixed at construction. Lookup is one compare plus one table
/// load, indexed by `ceil(size / SIZE_QUANTUM)`.
#[derive(Debug)]
pub(crate) struct SizeClasses {
    classes: [usize; NUM_SIZE_CLASSES],
    lut: Box<[u8]>,
}

impl SizeClasses {
    /// Build the lookup table for `classes`, which must already be validated
    /// (strictly increasing, non-zero multiples of [`SIZE_QUANTUM`]).
    pub fn new(classes: [usize; NUM_SIZE_CLASSES]) -> Self {
        debug_assert!(
            validate_ladder(&classes).is_ok(),
            "size class ladder {classes:?} is invalid"
        );
        let max = classes[NUM_SIZE_CLASSES - 1];
        let mut lut = vec![0u8; max / SIZE_QUANTUM + 1].into_boxed_slice();

        // lut[0] covers size 0, which is served as size 1 (class 0).
        let mut quantum = 1;
        for (idx, &class) in classes.iter().enumerate() {
            while quantum <= class / SIZE_QUANTUM {
                lut[quantum] = u8::try_from(idx).unwrap_or(u8::MAX);
                quantum += 1;
            }
        }

        Self { classes, lut }
    }

    /// Index of the smallest class that holds `size` bytes, or `None` when
    /// `size` exceeds the pooled range. A request of 0 bytes is treated as 1.
    #[inline]
    pub fn index(&self, size: usize) -> Option<usize> {
        if size > self.max_size() {
            return None;
        }
        Some(self.lut[size.div_ceil(SIZE_QUANTUM)] as usize)
    }

    /// Smallest class that holds `size` bytes and whose blocks are naturally
    /// aligned to at least `align`.
    pub fn index_aligned(&self, size: usize, align: usize, chunk_size: usize) -> Option<usize> {
        let start = self.index(size)?;
        (start..NUM_SIZE_CLASSES).find(|&idx| self.natural_align(idx, chunk_size) >= align)
    }

    /// Alignment every block of class `idx` is guaranteed to have, given that
    /// chunks start on `chunk_size` boundaries.
    #[inline]
    pub fn natural_align(&self, idx: usize, chunk_size: usize) -> usize {
        let block = self.classes[idx];
        (1usize << block.trailing_zeros()).min(chunk_size)
    }

    #[inline]
    pub fn block_size(&self, idx: usize) -> usize {
        self.classes[idx]
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.classes[NUM_SIZE_CLASSES - 1]
    }

    pub fn as_array(&self) -> &[usize; NUM_SIZE_CLASSES] {
        &self.classes
    }
}

/// Check a ladder: strictly increasing, each a non-zero multiple of
/// [`SIZE_QUANTUM`].
pub(crate) fn validate_ladder(classes: &[usize; NUM_SIZE_CLASSES]) -> Result<(), String> {
    if let Some(bad) = classes
        .iter()
        .find(|&&c| c == 0 || !c.is_multiple_of(SIZE_QUANTUM))
    {
        return Err(format!(
            "size class {bad} is not a non-zero multiple of {SIZE_QUANTUM}"
        ));
    }
    if let Some(pair) = classes.windows(2).find(|w| w[0] >= w[1]) {
        return Err(format!(
            "size classes must be strictly increasing ({} >= {})",
            pair[0], pair[1]
        ));
    }
    Ok(())
}
