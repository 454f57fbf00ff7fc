//! Cross-tier operator properties.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;

use alpha_graph::{BuiltinLibrary, FactorId, FactorLibrary, Strategy, ValidationError};
use alpha_mutate::{tier1, tier2, InsertionPoint, NoiseModel};

fn momentum_chain(lib: &BuiltinLibrary, id: &str) -> Strategy {
    let empty = BTreeMap::new();
    let mut s = Strategy::new(id, 0, vec![]);
    s.insert_factor(lib.instantiate("rsi", FactorId(0), &empty).unwrap());
    s.insert_factor(lib.instantiate("momentum_rank", FactorId(1), &empty).unwrap());
    s.insert_factor(lib.instantiate("signal_momentum", FactorId(2), &empty).unwrap());
    s
}

/// Spec shape A -> B -> C: replacing A with a compatible factor succeeds
/// and leaves B and C wired; replacing with an incompatible one is
/// rejected with OutputIncompatible and the original stays intact.
#[test]
fn replace_factor_transitive_correctness() {
    let lib = BuiltinLibrary::new();
    let original = momentum_chain(&lib, "abc");
    original.validate().unwrap();
    let before = original.clone();
    let empty = BTreeMap::new();

    let mut rng = StdRng::seed_from_u64(21);
    let replaced = tier2::replace_factor(&lib, &original, FactorId(0), "rsi", &empty, 1, &mut rng)
        .expect("compatible replacement must succeed");
    assert_eq!(replaced.factor_count(), 3);
    replaced.validate().unwrap();
    // B still depends on A's channel, C on B's.
    assert_eq!(
        replaced.transitive_dependents(FactorId(0)),
        [FactorId(1), FactorId(2)].into_iter().collect()
    );

    let err = tier2::replace_factor(&lib, &original, FactorId(0), "atr", &empty, 1, &mut rng)
        .expect_err("incompatible replacement must be rejected");
    assert!(matches!(
        err.validation(),
        Some(ValidationError::OutputIncompatible { .. })
    ));
    assert_eq!(original, before);
}

/// The same property must hold through the configuration tier's
/// document-rebuild path.
#[test]
fn replace_factor_transitive_correctness_tier1() {
    let lib = BuiltinLibrary::new();
    let original = momentum_chain(&lib, "abc1");
    let before = original.clone();
    let empty = BTreeMap::new();

    let mut rng = StdRng::seed_from_u64(22);
    let replaced = tier1::replace_factor(&lib, &original, FactorId(0), "rsi", &empty, 1, &mut rng)
        .expect("compatible replacement must succeed");
    replaced.validate().unwrap();

    let err = tier1::replace_factor(&lib, &original, FactorId(0), "ema_gap", &empty, 1, &mut rng)
        .expect_err("incompatible replacement must be rejected");
    assert!(matches!(
        err.validation(),
        Some(ValidationError::OutputIncompatible { .. })
    ));
    assert_eq!(original, before);
}

#[test]
fn remove_factor_signal_guard_holds_everywhere() {
    let lib = BuiltinLibrary::new();
    let empty = BTreeMap::new();

    // Single-chain strategy: the one signal producer is untouchable.
    let s = momentum_chain(&lib, "guard");
    for cascade in [false, true] {
        let mut rng = StdRng::seed_from_u64(23);
        assert!(tier1::remove_factor(&lib, &s, FactorId(2), cascade, 1, &mut rng).is_err());
        assert!(tier2::remove_factor(&s, FactorId(2), cascade, 1, &mut rng).is_err());
    }

    // Two signal producers: removing one is fine, removing the survivor
    // is again rejected.
    let mut s2 = momentum_chain(&lib, "guard2");
    s2.insert_factor(lib.instantiate("ema_gap", FactorId(3), &empty).unwrap());
    s2.insert_factor(lib.instantiate("trend_rank", FactorId(4), &empty).unwrap());
    s2.insert_factor(lib.instantiate("signal_trend", FactorId(5), &empty).unwrap());
    s2.validate().unwrap();

    let mut rng = StdRng::seed_from_u64(24);
    let reduced = tier2::remove_factor(&s2, FactorId(5), false, 1, &mut rng);
    // signal_trend's upstream becomes orphaned without a cascade, so only
    // the cascading form can succeed from the top of the chain.
    let reduced = match reduced {
        Ok(r) => r,
        Err(_) => tier2::remove_factor(&s2, FactorId(3), true, 1, &mut rng).unwrap(),
    };
    reduced.validate().unwrap();
    let last_signal = reduced.signal_producers()[0];
    for cascade in [false, true] {
        assert!(tier2::remove_factor(&reduced, last_signal, cascade, 1, &mut rng).is_err());
    }
}

#[test]
fn add_factor_orphan_rules_across_tiers() {
    let lib = BuiltinLibrary::new();
    let s = momentum_chain(&lib, "orphans");
    let empty = BTreeMap::new();

    for seed in 0..4u64 {
        let mut rng = StdRng::seed_from_u64(30 + seed);
        // Root insert of an unconsumed factor violates the orphan rule in
        // both structural tiers.
        let e1 = tier1::add_factor(&lib, &s, "atr", &empty, InsertionPoint::Root, 1, &mut rng);
        assert!(matches!(
            e1.unwrap_err().validation(),
            Some(ValidationError::OrphanedFactor { .. })
        ));
        let e2 = tier2::add_factor(&lib, &s, "atr", &empty, InsertionPoint::Root, 1, &mut rng);
        assert!(matches!(
            e2.unwrap_err().validation(),
            Some(ValidationError::OrphanedFactor { .. })
        ));

        // Leaf insert is always structurally safe.
        let leaf = tier1::add_factor(&lib, &s, "atr", &empty, InsertionPoint::Leaf, 1, &mut rng);
        assert!(leaf.unwrap().validate().is_ok());
    }
}

#[test]
fn parameter_noise_respects_integer_ranges() {
    let lib = BuiltinLibrary::new();
    let s = momentum_chain(&lib, "noise");
    let mut rng = StdRng::seed_from_u64(40);
    for _ in 0..30 {
        let child = tier1::mutate_parameters(
            &lib,
            &s,
            FactorId(0),
            NoiseModel::Gaussian { sigma: 0.6 },
            1,
            &mut rng,
        )
        .unwrap();
        let rsi = child.factors.values().find(|f| f.name == "rsi").unwrap();
        match rsi.parameters["period"] {
            alpha_graph::ParamValue::Int(p) => assert!((2..=64).contains(&p)),
            other => panic!("integer parameter became {:?}", other),
        }
    }
}
