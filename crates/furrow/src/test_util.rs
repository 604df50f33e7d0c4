use once_cell::sync::Lazy;

/// Opt-in tracing for tests: set `TEST_LOG` to see the hierarchical log tree.
pub fn setup_test_tracing() {
    static TRACING: Lazy<()> = Lazy::new(|| {
        use tracing_subscriber::layer::SubscriberExt;

        if std::env::var("TEST_LOG").is_err() {
            return;
        }

        let tree = tracing_tree::HierarchicalLayer::new(2)
            .with_targets(true)
            .with_bracketed_fields(true);
        let subscriber = tracing_subscriber::Registry::default().with(tree);
        tracing::subscriber::set_global_default(subscriber).ok();
    });

    Lazy::force(&TRACING);
}
