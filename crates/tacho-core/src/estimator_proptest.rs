#[cfg(test)]
mod proptest_estimator {
    use crate::estimator::*;
    use proptest::prelude::*;
    use std::num::NonZeroU32;

    fn estimator(slots: u32) -> FrequencyEstimator {
        let slots = NonZeroU32::new(slots).unwrap_or(NonZeroU32::MIN);
        FrequencyEstimator::new(slots, EstimatorConfig::default())
    }

    /// Feed `count` edges spaced `dt_us` apart, starting after `start_us`.
    fn feed_steady(est: &mut FrequencyEstimator, start_us: u64, dt_us: u64, count: usize) -> u64 {
        let mut ts = start_us;
        for _ in 0..count {
            ts += dt_us;
            est.on_edge(ts);
        }
        ts
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(2000))]

        // Property: any timestamp sequence yields a finite, non-negative reading
        #[test]
        fn reading_is_never_negative_or_nan(
            slots in 1u32..=64,
            gaps in prop::collection::vec(0u64..500_000, 1..200),
        ) {
            let mut est = estimator(slots);
            let mut ts = 0u64;
            for gap in gaps {
                ts += gap;
                est.on_edge(ts);
                let hz = est.frequency_hz();
                prop_assert!(hz.is_finite(), "hz={}", hz);
                prop_assert!(hz >= 0.0, "hz={}", hz);
            }
        }

        // Property: a bounce edge below the noise floor leaves the reading alone
        #[test]
        fn bounce_leaves_reading_unchanged(
            slots in 1u32..=20,
            dt_us in 2_000u64..200_000,
            bounce_us in 1u64..900,
            warmup in 6usize..30,
        ) {
            let mut est = estimator(slots);
            let ts = feed_steady(&mut est, 0, dt_us, warmup);
            let before = est.smoothed_hz();

            est.on_edge(ts + bounce_us);

            prop_assert_eq!(est.smoothed_hz(), before);
            prop_assert_eq!(est.rejected_edges(), 1);
        }

        // Property: one extreme outlier moves the reading by at most the spike ratio
        #[test]
        fn single_outlier_is_bounded(
            slots in 1u32..=20,
            dt_us in 5_000u64..200_000,
            outlier_dt_us in 900u64..2_000,
            warmup in 6usize..30,
        ) {
            let config = EstimatorConfig::default();
            let mut est = estimator(slots);
            let ts = feed_steady(&mut est, 0, dt_us, warmup);
            let before = est.smoothed_hz();

            est.on_edge(ts + outlier_dt_us);

            let after = est.smoothed_hz();
            prop_assert!(
                after <= before * config.max_jump_ratio * (1.0 + 1e-5),
                "before={}, after={}", before, after
            );
        }

        // Property: constant-rate edges converge within 1% inside 10 edges
        #[test]
        fn constant_rate_converges(
            slots in 1u32..=20,
            dt_us in 900u64..500_000,
        ) {
            let mut est = estimator(slots);
            feed_steady(&mut est, 1_000, dt_us, 10);

            let expected = 1_000_000.0 / dt_us as f32 / slots as f32;
            let error = (est.smoothed_hz() - expected).abs();
            prop_assert!(
                error <= expected * 0.01,
                "expected={}, got={}",
                expected,
                est.smoothed_hz()
            );
        }

        // Property: reset behaves like a fresh estimator
        #[test]
        fn reset_forgets_history(
            slots in 1u32..=20,
            first_dt in 1_000u64..100_000,
            second_dt in 1_000u64..100_000,
        ) {
            let mut reused = estimator(slots);
            let ts = feed_steady(&mut reused, 0, first_dt, 12);
            reused.reset();
            feed_steady(&mut reused, ts + 7_777, second_dt, 8);

            let mut fresh = estimator(slots);
            feed_steady(&mut fresh, 0, second_dt, 8);

            prop_assert_eq!(reused.smoothed_hz(), fresh.smoothed_hz());
        }
    }
}
