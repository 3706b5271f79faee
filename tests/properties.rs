use std::{sync::Arc, time::Duration};

use proptest::prelude::*;
use stampede::{
    ExecutionSegment, Executor, Stage,
    event::EventBus,
    executor::{ConstantArrivalRate, PerVuIterations, RampingArrivalRate, SharedIterations},
    mock::MockVuFactory,
    pool::{VuIds, VuPool},
};

fn split(num: u64, den: u64) -> (ExecutionSegment, ExecutionSegment) {
    let left = format!("0:{num}/{den}").parse().unwrap();
    let right = format!("{num}/{den}:1").parse().unwrap();
    (left, right)
}

fn assert_additive(executor: &impl Executor, num: u64, den: u64) -> Result<(), TestCaseError> {
    let (left, right) = split(num, den);
    let whole = executor.planned_iterations(&ExecutionSegment::full()).unwrap();
    let parts = executor.planned_iterations(&left).unwrap() + executor.planned_iterations(&right).unwrap();
    prop_assert!(
        parts.abs_diff(whole) <= 1,
        "{parts} planned over 0:{num}/{den} and {num}/{den}:1, {whole} over the whole"
    );
    Ok(())
}

#[derive(Debug, Clone)]
enum Op {
    Acquire,
    Release,
    /// Drop a held VU without returning it.
    Discard,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![3 => Just(Op::Acquire), 2 => Just(Op::Release), 1 => Just(Op::Discard)]
}

proptest! {
    #[test]
    fn segment_shares_add_up(n in 0u64..100_000, num in 1u64..50, extra in 1u64..50) {
        let den = num + extra;
        let (left, right) = split(num, den);
        prop_assert_eq!(left.scale(n) + right.scale(n), n);
    }

    #[test]
    fn planned_iterations_are_additive(
        num in 1u64..20,
        extra in 1u64..20,
        vus in 1u64..50,
        iterations in 50u64..5_000,
        rate in 1u64..500,
        secs in 1u64..120,
    ) {
        let den = num + extra;
        let shared = SharedIterations {
            vus,
            iterations,
            max_duration: Duration::from_secs(600),
        };
        assert_additive(&shared, num, den)?;

        let per_vu = PerVuIterations {
            vus,
            iterations,
            max_duration: Duration::from_secs(600),
        };
        assert_additive(&per_vu, num, den)?;

        let constant = ConstantArrivalRate {
            rate,
            time_unit: Duration::from_secs(1),
            duration: Duration::from_secs(secs),
            pre_allocated_vus: vus,
            max_vus: None,
        };
        assert_additive(&constant, num, den)?;

        let ramping = RampingArrivalRate {
            start_rate: 0,
            time_unit: Duration::from_secs(1),
            stages: vec![
                Stage::new(Duration::from_secs(secs), rate),
                Stage::new(Duration::from_secs(secs / 2 + 1), 0),
            ],
            pre_allocated_vus: vus,
            max_vus: None,
        };
        assert_additive(&ramping, num, den)?;
    }

    #[test]
    fn pool_holds_what_is_outstanding(max in 1usize..8, ops in prop::collection::vec(op(), 1..64)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let factory = Arc::new(MockVuFactory::builder().build().unwrap());
            let pool = Arc::new(VuPool::new(
                Arc::from("prop"),
                factory,
                VuIds::default(),
                EventBus::default(),
                max,
            ));
            let mut held = Vec::new();
            for op in ops {
                match op {
                    Op::Acquire => match pool.try_acquire().unwrap() {
                        Some(reservation) => held.push(reservation.checkout().await.unwrap()),
                        None => prop_assert_eq!(held.len(), max),
                    },
                    Op::Release => {
                        if let Some(vu) = held.pop() {
                            vu.release(None);
                        }
                    }
                    Op::Discard => drop(held.pop()),
                }
                let stats = pool.stats();
                prop_assert_eq!(stats.held, held.len());
                prop_assert!(stats.held <= max);
                prop_assert!(stats.alive <= max);
            }
            Ok(())
        })?;
    }
}
