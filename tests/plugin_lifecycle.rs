//! Plugin and reader lifecycle: registration, lookups, pool allocation and
//! the not-registered error contract.

mod common;

use std::sync::Arc;

use common::{
    MockPluginFactory, MockPluginSpi, MockPoolPluginFactory, MockPoolPluginSpi, MockReaderSpi,
    ObservationStyle,
};
use smart_card_service::error::ServiceError;
use smart_card_service::service::SmartCardService;
use smart_card_service::spi::ReaderSpi;

fn plugin_factory_with_readers(plugin_name: &str, reader_names: &[&str]) -> MockPluginFactory {
    let readers: Vec<Arc<dyn ReaderSpi>> = reader_names
        .iter()
        .map(|name| {
            Arc::new(MockReaderSpi::new(name, ObservationStyle::NotObservable))
                as Arc<dyn ReaderSpi>
        })
        .collect();
    MockPluginFactory::new(
        plugin_name,
        Arc::new(MockPluginSpi::new(plugin_name, readers)),
    )
}

#[test]
fn registered_plugin_exposes_its_reader_names() {
    smart_card_service::logger::setup_logging(log::LevelFilter::Warn);
    let service = SmartCardService::new();
    let plugin = service
        .register_plugin(&plugin_factory_with_readers("plugin", &["reader1"]))
        .expect("plugin registered");

    assert_eq!(plugin.reader_names().expect("names"), vec!["reader1"]);
    assert_eq!(service.plugin_names(), vec!["plugin"]);
    assert!(service.get_plugin("plugin").is_some());
}

#[test]
fn duplicate_plugin_names_are_rejected() {
    let service = SmartCardService::new();
    service
        .register_plugin(&plugin_factory_with_readers("plugin", &[]))
        .expect("plugin registered");
    let result = service.register_plugin(&plugin_factory_with_readers("plugin", &[]));
    assert!(matches!(
        result,
        Err(ServiceError::PluginRegistration(_))
    ));
}

#[test]
fn factory_and_driver_names_must_agree() {
    let service = SmartCardService::new();
    let factory = MockPluginFactory::new(
        "expected-name",
        Arc::new(MockPluginSpi::new("other-name", Vec::new())),
    );
    assert!(matches!(
        service.register_plugin(&factory),
        Err(ServiceError::PluginRegistration(_))
    ));
}

#[test]
fn reader_lookup_by_name_and_by_regex() {
    let service = SmartCardService::new();
    let plugin = service
        .register_plugin(&plugin_factory_with_readers(
            "plugin",
            &["contact-reader", "contactless-reader"],
        ))
        .expect("plugin registered");

    assert_eq!(
        plugin
            .get_reader("contact-reader")
            .expect("reader found")
            .name(),
        "contact-reader"
    );
    assert!(matches!(
        plugin.get_reader("missing"),
        Err(ServiceError::IllegalArgument(_))
    ));

    let found = service
        .find_reader("contactless-.*")
        .expect("reader matched");
    assert_eq!(found.name(), "contactless-reader");
    assert!(matches!(
        plugin.find_reader("("),
        Err(ServiceError::IllegalArgument(_))
    ));

    assert_eq!(
        service
            .get_plugin_of_reader("contact-reader")
            .expect("owning plugin")
            .name(),
        "plugin"
    );
}

#[test]
fn unregistered_plugin_and_readers_reject_every_call() {
    let service = SmartCardService::new();
    let plugin = service
        .register_plugin(&plugin_factory_with_readers("plugin", &["reader1"]))
        .expect("plugin registered");
    let reader = plugin.get_reader("reader1").expect("reader found");

    service.unregister_plugin("plugin");

    assert!(!plugin.is_registered());
    assert!(matches!(
        plugin.reader_names(),
        Err(ServiceError::IllegalState(_))
    ));
    assert!(!reader.is_registered());
    assert!(matches!(
        reader.is_card_present(),
        Err(ServiceError::IllegalState(_))
    ));
    assert!(service.get_plugin("plugin").is_none());
}

#[test]
fn pool_plugin_allocates_and_releases_readers() {
    let service = SmartCardService::new();
    let spi = Arc::new(MockPoolPluginSpi::new("pool", &["group-a", "group-b"]));
    let pool = service
        .register_pool_plugin(&MockPoolPluginFactory::new("pool", spi.clone()))
        .expect("pool plugin registered");

    assert_eq!(
        pool.reader_group_references().expect("groups"),
        vec!["group-a", "group-b"]
    );

    let reader = pool.allocate_reader("group-a").expect("reader allocated");
    assert_eq!(reader.name(), "group-a-reader");
    assert_eq!(pool.reader_names().expect("names"), vec!["group-a-reader"]);
    assert!(pool.get_selected_smart_card(&reader).is_some());

    pool.release_reader(&reader).expect("reader released");
    assert!(pool.reader_names().expect("names").is_empty());
    assert!(!reader.is_registered());
    assert_eq!(spi.released_readers(), vec!["group-a-reader"]);

    assert!(matches!(
        pool.allocate_reader("unknown-group"),
        Err(ServiceError::PluginIo { .. })
    ));
}

#[test]
fn pool_plugin_unregister_releases_everything() {
    let service = SmartCardService::new();
    let spi = Arc::new(MockPoolPluginSpi::new("pool", &["group-a"]));
    let pool = service
        .register_pool_plugin(&MockPoolPluginFactory::new("pool", spi.clone()))
        .expect("pool plugin registered");
    let reader = pool.allocate_reader("group-a").expect("reader allocated");

    service.unregister_plugin("pool");

    assert!(!reader.is_registered());
    assert_eq!(spi.released_readers(), vec!["group-a-reader"]);
    assert!(matches!(
        pool.reader_group_references(),
        Err(ServiceError::IllegalState(_))
    ));
}

#[test]
fn process_wide_service_handle_is_shared() {
    let service = smart_card_service::smart_card_service();
    service
        .register_plugin(&plugin_factory_with_readers("lifecycle-global", &["reader1"]))
        .expect("plugin registered");
    assert!(smart_card_service::smart_card_service().is_plugin_registered("lifecycle-global"));
    service.unregister_plugin("lifecycle-global");
    assert!(!service.is_plugin_registered("lifecycle-global"));
}
