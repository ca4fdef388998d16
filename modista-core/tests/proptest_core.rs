use modista_core::{TrainConfig, load_config, model_identifier};
use proptest::prelude::*;

proptest! {
    #[test]
    fn identifier_names_every_component(
        dim in 1u32..4096,
        limit in proptest::option::of(1usize..1_000_000),
        classes in 1usize..500,
    ) {
        let id = model_identifier(dim, limit, classes);
        let prefix = format!("dim_{dim}_images_");
        let suffix = format!("_classes_{classes}");
        prop_assert!(id.starts_with(&prefix));
        prop_assert!(id.ends_with(&suffix));
        let images = &id[prefix.len()..id.len() - suffix.len()];
        match limit {
            Some(n) => prop_assert_eq!(images, n.to_string()),
            None => prop_assert_eq!(images, "all"),
        }
    }

    #[test]
    fn cli_overrides_replace_only_their_fields(
        batch_size in 1usize..256,
        epochs in 1usize..100,
        lr in 1e-6f64..1.0,
    ) {
        let overrides = serde_json::json!({
            "training": { "batch_size": batch_size, "num_epochs": epochs },
            "optimizer": { "lr": lr },
        });
        let config = load_config(None, Some(&overrides)).unwrap();
        let defaults = TrainConfig::default();
        prop_assert_eq!(config.training.batch_size, batch_size);
        prop_assert_eq!(config.training.num_epochs, epochs);
        prop_assert_eq!(config.optimizer.lr, lr);
        prop_assert_eq!(config.training.save_every, defaults.training.save_every);
        prop_assert_eq!(&config.data, &defaults.data);
        prop_assert!(config.validate().is_ok());
    }

    #[test]
    fn fingerprint_tracks_config_changes(lr in 1e-6f64..1.0, dim_step in 1u32..16) {
        let mut a = TrainConfig::default();
        a.optimizer.lr = lr;
        let b = a.clone();
        prop_assert_eq!(a.fingerprint(), b.fingerprint());

        let mut c = a.clone();
        c.data.target_dim = a.data.target_dim + 64 * dim_step;
        prop_assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn target_dim_must_be_a_multiple_of_64(dim in 1u32..2048) {
        let mut config = TrainConfig::default();
        config.data.target_dim = dim;
        prop_assert_eq!(config.validate().is_ok(), dim % 64 == 0);
    }
}
