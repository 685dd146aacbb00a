/// How a request's variants are split into invocations for one candidate batch size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchPlan {
    pub batch_size: usize,
    pub num_full_batches: usize,
    pub remainder_size: usize,
}

impl BatchPlan {
    /// Plans `num_variants` outputs in batches of `batch_size`.
    ///
    /// Both arguments must be positive; the scheduler never asks for more.
    pub fn new(num_variants: usize, batch_size: usize) -> Self {
        debug_assert!(num_variants > 0 && batch_size > 0);
        Self {
            batch_size,
            num_full_batches: num_variants / batch_size,
            remainder_size: num_variants % batch_size,
        }
    }

    /// Number of generation invocations the plan needs.
    pub fn num_invocations(&self) -> usize {
        self.num_full_batches + usize::from(self.remainder_size > 0)
    }

    /// Image count of every invocation in submission order: full batches first, then the remainder.
    pub fn invocation_sizes(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::repeat(self.batch_size)
            .take(self.num_full_batches)
            .chain((self.remainder_size > 0).then_some(self.remainder_size))
    }

    pub fn num_variants(&self) -> usize {
        self.num_full_batches * self.batch_size + self.remainder_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_variants_in_fours() {
        let plan = BatchPlan::new(10, 4);
        assert_eq!(plan.num_full_batches, 2);
        assert_eq!(plan.remainder_size, 2);
        assert_eq!(plan.num_invocations(), 3);
        assert_eq!(plan.invocation_sizes().collect::<Vec<_>>(), vec![4, 4, 2]);
    }

    #[test]
    fn even_split_has_no_remainder_invocation() {
        let plan = BatchPlan::new(6, 3);
        assert_eq!(plan.invocation_sizes().collect::<Vec<_>>(), vec![3, 3]);
    }

    #[test]
    fn plan_always_covers_every_variant() {
        for n in 1..=24 {
            for b in 1..=n {
                let plan = BatchPlan::new(n, b);
                assert_eq!(plan.num_variants(), n, "n={n} b={b}");
                assert!(plan.remainder_size < b);
                assert_eq!(plan.invocation_sizes().sum::<usize>(), n);
            }
        }
    }
}
