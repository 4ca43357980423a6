use std::collections::BTreeSet;

use eid_iomem_driver::{IdAllocator, IomemError};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Allocate,
    /// Release the n-th live id (modulo the live count)
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Allocate),
        2 => any::<usize>().prop_map(Op::Release),
    ]
}

proptest! {
    #[test]
    fn ids_are_unique_smallest_free_and_bounded(
        max in 1u32..=130,
        ops in proptest::collection::vec(op(), 1..400),
    ) {
        let ida = IdAllocator::new(max);
        let mut live = BTreeSet::new();

        for op in ops {
            match op {
                Op::Allocate => match ida.allocate() {
                    Ok(id) => {
                        prop_assert!(id < max);
                        let expected = (0..max).find(|i| !live.contains(i));
                        prop_assert_eq!(Some(id), expected);
                        prop_assert!(live.insert(id));
                    }
                    Err(IomemError::ResourceExhausted { max: m }) => {
                        prop_assert_eq!(m, max);
                        prop_assert_eq!(live.len(), max as usize);
                    }
                    Err(e) => prop_assert!(false, "unexpected error {e}"),
                },
                Op::Release(n) => {
                    if let Some(&id) = live.iter().nth(n % live.len().max(1)) {
                        ida.release(id);
                        live.remove(&id);
                        prop_assert!(!ida.is_allocated(id));
                    }
                }
            }
            prop_assert_eq!(ida.in_use() as usize, live.len());
        }
    }
}
