use anyhow::{Result, ensure};
use rand::Rng;
use rand::seq::SliceRandom;
use std::ops::Range;

/// A group of parallel arrays sharing one leading dimension.
pub trait Columns: Sized {
    /// Leading length, taken from the first column.
    fn len(&self) -> usize;
    /// True when every column has the same leading length.
    fn is_aligned(&self) -> bool;
    /// Reorder every column so that position `i` holds old element `order[i]`.
    fn permute(&mut self, order: &[usize]);
    fn slice(&self, range: Range<usize>) -> Self;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Columns for Vec<T> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn is_aligned(&self) -> bool {
        true
    }

    fn permute(&mut self, order: &[usize]) {
        let permuted: Vec<T> = order.iter().map(|&i| self[i].clone()).collect();
        *self = permuted;
    }

    fn slice(&self, range: Range<usize>) -> Self {
        self[range].to_vec()
    }
}

macro_rules! impl_columns_for_tuple {
    ($first:ident $(, $rest:ident)*) => {
        #[allow(non_snake_case)]
        impl<$first: Columns $(, $rest: Columns)*> Columns for ($first, $($rest,)*) {
            fn len(&self) -> usize {
                let ($first, ..) = self;
                $first.len()
            }

            fn is_aligned(&self) -> bool {
                let ($first, $($rest,)*) = self;
                let n = $first.len();
                $first.is_aligned() $(&& $rest.is_aligned() && $rest.len() == n)*
            }

            fn permute(&mut self, order: &[usize]) {
                let ($first, $($rest,)*) = self;
                $first.permute(order);
                $($rest.permute(order);)*
            }

            fn slice(&self, range: Range<usize>) -> Self {
                let ($first, $($rest,)*) = self;
                ($first.slice(range.clone()), $($rest.slice(range.clone()),)*)
            }
        }
    };
}

impl_columns_for_tuple!(A);
impl_columns_for_tuple!(A, B);
impl_columns_for_tuple!(A, B, C);
impl_columns_for_tuple!(A, B, C, D);

// =============================================================================
// Batcher
// =============================================================================

/// Walks a group of parallel arrays in contiguous slices of at most
/// `batch_size` elements. Order only changes through [`Batcher::shuffle`].
pub struct Batcher<C: Columns> {
    batch_size: usize,
    columns: C,
    cursor: usize,
}

impl<C: Columns> Batcher<C> {
    pub fn new(batch_size: usize, columns: C) -> Result<Self> {
        ensure!(batch_size > 0, "batch size must be positive");
        ensure!(
            columns.is_aligned(),
            "parallel arrays have different leading lengths"
        );
        Ok(Self {
            batch_size,
            columns,
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    /// Apply one random permutation to every column.
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        self.columns.permute(&order);
    }

    pub fn next_batch(&mut self) -> Option<C> {
        if self.end() {
            return None;
        }
        let stop = (self.cursor + self.batch_size).min(self.len());
        let batch = self.columns.slice(self.cursor..stop);
        self.cursor = stop;
        Some(batch)
    }

    pub fn end(&self) -> bool {
        self.cursor >= self.len()
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn into_columns(self) -> C {
        self.columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use rstest::rstest;

    fn drain<C: Columns>(b: &mut Batcher<C>) -> Vec<C> {
        let mut out = Vec::new();
        while let Some(batch) = b.next_batch() {
            out.push(batch);
        }
        out
    }

    #[rstest]
    #[case(0, 4)]
    #[case(1, 4)]
    #[case(7, 3)]
    #[case(8, 4)]
    #[case(9, 4)]
    #[case(33, 32)]
    fn yields_ceil_batches_covering_everything(#[case] len: usize, #[case] batch: usize) {
        let xs: Vec<usize> = (0..len).collect();
        let ys: Vec<i64> = (0..len as i64).map(|v| -v).collect();
        let mut b = Batcher::new(batch, (xs.clone(), ys.clone())).unwrap();
        assert_eq!(b.num_batches(), len.div_ceil(batch));

        let batches = drain(&mut b);
        assert_eq!(batches.len(), len.div_ceil(batch));
        assert!(batches.iter().all(|(x, _)| x.len() <= batch));
        let flat_x: Vec<usize> = batches.iter().flat_map(|(x, _)| x.clone()).collect();
        let flat_y: Vec<i64> = batches.iter().flat_map(|(_, y)| y.clone()).collect();
        assert_eq!(flat_x, xs);
        assert_eq!(flat_y, ys);
        assert!(b.end());
    }

    #[test]
    fn shuffle_keeps_rows_paired() {
        let tags: Vec<usize> = (0..100).collect();
        let squares: Vec<usize> = tags.iter().map(|t| t * t).collect();
        let labels: Vec<String> = tags.iter().map(|t| format!("row-{t}")).collect();
        let mut b = Batcher::new(16, (tags.clone(), squares, labels)).unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        b.shuffle(&mut rng);

        let (t, s, l) = b.into_columns();
        assert_ne!(t, tags, "a 100-element shuffle should move something");
        for i in 0..t.len() {
            assert_eq!(s[i], t[i] * t[i]);
            assert_eq!(l[i], format!("row-{}", t[i]));
        }
        let mut sorted = t.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, tags);
    }

    #[test]
    fn reset_replays_the_same_order() {
        let mut b = Batcher::new(3, (0..10).collect::<Vec<u32>>()).unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        b.shuffle(&mut rng);
        let first = drain(&mut b);
        b.reset();
        assert!(!b.end());
        let second = drain(&mut b);
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_misaligned_columns_and_zero_batch() {
        assert!(Batcher::new(2, (vec![1, 2, 3], vec![1, 2])).is_err());
        assert!(Batcher::new(0, vec![1, 2, 3]).is_err());
    }
}
