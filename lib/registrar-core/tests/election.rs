use registrar_api::keys::servers_prefix;
use registrar_api::{BackendSpec, Middleware};
use registrar_core::{
    AppRegistration, GroupMasterStrategy, HandlerRegistration, Heartbeater, MasterElector,
    MultiMasterStrategy, RegistrationStrategy, Result, SingleMasterStrategy, SkipStrategy,
};
use registrar_store::{KvStore, MemoryStore};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

const NS: &str = "/vulcand";
const TTL: Duration = Duration::from_secs(3);

fn app(port: u16) -> AppRegistration {
    AppRegistration {
        name: "app1".to_string(),
        host: "10.0.0.1".to_string(),
        port,
    }
}

#[tokio::test]
async fn test_racing_electors_yield_one_master() {
    let store = MemoryStore::new();
    let mut a = MasterElector::new(Arc::new(store.clone()), NS, TTL);
    let mut b = MasterElector::new(Arc::new(store.clone()), NS, TTL);
    let backend_a = BackendSpec::with_id("master", "app1", "10.0.0.1", 8000).unwrap();
    let backend_b = BackendSpec::with_id("master", "app1", "10.0.0.2", 8000).unwrap();

    let (ra, rb) = tokio::join!(a.register_app(&backend_a), b.register_app(&backend_b));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert!(ra ^ rb, "exactly one master, got {} and {}", ra, rb);

    let (master, slave, slave_backend, master_backend) = if ra {
        (&mut a, &mut b, &backend_b, &backend_a)
    } else {
        (&mut b, &mut a, &backend_a, &backend_b)
    };

    // The slave stays slave while the master holds the key
    assert!(!slave.register_app(slave_backend).await.unwrap());
    assert!(master.register_app(master_backend).await.unwrap());

    store.delete("/vulcand/backends/app1/servers/master").await.unwrap();
    assert!(slave.register_app(slave_backend).await.unwrap());

    // The old master finds someone else's value and steps down
    assert!(!master.register_app(master_backend).await.unwrap());
    assert!(!master.is_master());
    assert!(slave.is_master());
}

#[tokio::test(start_paused = true)]
async fn test_slave_takes_over_after_master_dies() {
    let store = MemoryStore::new();
    let mut a = MasterElector::new(Arc::new(store.clone()), NS, TTL);
    let mut b = MasterElector::new(Arc::new(store.clone()), NS, TTL);
    let backend_a = BackendSpec::with_id("master", "app1", "10.0.0.1", 8000).unwrap();
    let backend_b = BackendSpec::with_id("master", "app1", "10.0.0.2", 8000).unwrap();

    assert!(a.register_app(&backend_a).await.unwrap());
    assert!(!b.register_app(&backend_b).await.unwrap());

    // a stops renewing
    time::sleep(TTL + Duration::from_secs(1)).await;
    assert!(b.register_app(&backend_b).await.unwrap());

    let server = store.get("/vulcand/backends/app1/servers/master").await.unwrap().unwrap();
    assert_eq!(server.value, r#"{"URL":"http://10.0.0.2:8000"}"#);
}

#[tokio::test(start_paused = true)]
async fn test_master_steps_down_when_store_fails() {
    let store = MemoryStore::new();
    let mut a = MasterElector::new(Arc::new(store.clone()), NS, TTL);
    let mut b = MasterElector::new(Arc::new(store.clone()), NS, TTL);
    let backend_a = BackendSpec::with_id("master", "app1", "10.0.0.1", 8000).unwrap();
    let backend_b = BackendSpec::with_id("master", "app1", "10.0.0.2", 8000).unwrap();

    assert!(a.register_app(&backend_a).await.unwrap());
    assert!(!b.register_app(&backend_b).await.unwrap());

    store.set_available(false);
    assert!(a.register_app(&backend_a).await.is_err());
    assert!(!a.is_master());
    store.set_available(true);

    // a's key runs out while it was cut off and b claims it
    time::sleep(TTL + Duration::from_secs(1)).await;
    assert!(b.register_app(&backend_b).await.unwrap());
    assert!(!a.register_app(&backend_a).await.unwrap());
    assert!(!a.is_master());
    assert!(b.is_master());
}

#[tokio::test]
async fn test_single_master_strategy() {
    let store = MemoryStore::new();
    let mut first = SingleMasterStrategy::new(Arc::new(store.clone()), NS, TTL);
    let mut second = SingleMasterStrategy::new(Arc::new(store.clone()), NS, TTL);

    first.register_app(&app(8000)).await.unwrap();
    second.register_app(&app(8001)).await.unwrap();

    assert!(first.is_master());
    assert!(!second.is_master());
    assert_eq!(store.get_prefix(&servers_prefix(NS, "app1")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_group_master_strategy_per_group() {
    let store = MemoryStore::new();
    let mut east = GroupMasterStrategy::new(Arc::new(store.clone()), NS, "east", TTL);
    let mut west = GroupMasterStrategy::new(Arc::new(store.clone()), NS, "west", TTL);

    east.register_app(&app(8000)).await.unwrap();
    west.register_app(&app(8001)).await.unwrap();

    assert!(east.is_master());
    assert!(west.is_master());
    assert!(store.get("/vulcand/backends/app1/servers/east").await.unwrap().is_some());
    assert!(store.get("/vulcand/backends/app1/servers/west").await.unwrap().is_some());
}

#[tokio::test]
async fn test_multi_master_strategy() {
    let store = MemoryStore::new();
    let mut first = MultiMasterStrategy::new(Arc::new(store.clone()), NS, TTL);
    let mut second = MultiMasterStrategy::new(Arc::new(store.clone()), NS, TTL);

    first.register_app(&app(8000)).await.unwrap();
    second.register_app(&app(8001)).await.unwrap();

    let servers = store.get_prefix(&servers_prefix(NS, "app1")).await.unwrap();
    assert_eq!(servers.len(), 2);
    assert!(servers[0].key.ends_with("_8000"));
    assert!(servers[1].key.ends_with("_8001"));
}

#[tokio::test]
async fn test_register_handler() {
    let store = MemoryStore::new();
    let mut strategy = SingleMasterStrategy::new(Arc::new(store.clone()), NS, TTL);
    let handler = HandlerRegistration {
        name: "app1".to_string(),
        host: "localhost".to_string(),
        path: "/hello/{name}".to_string(),
        methods: vec!["GET".to_string()],
        middlewares: vec![Middleware::custom("bar", "bazz", json!("blah"))],
    };

    strategy.register_handler(&handler).await.unwrap();

    let frontend = store
        .get("/vulcand/frontends/localhost.get.hello.<name>/frontend")
        .await
        .unwrap()
        .unwrap();
    assert!(frontend.value.contains(r#""BackendId":"app1""#));
    let middleware = store
        .get("/vulcand/frontends/localhost.get.hello.<name>/middlewares/bazz")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        middleware.value,
        r#"{"Type":"bar","Id":"bazz","Priority":0,"Middleware":"blah"}"#
    );
}

#[tokio::test]
async fn test_skip_strategy_writes_nothing() {
    let mut strategy = SkipStrategy;
    strategy.register_app(&app(8000)).await.unwrap();
    strategy
        .register_handler(&HandlerRegistration {
            name: "app1".to_string(),
            host: "localhost".to_string(),
            path: "/".to_string(),
            methods: vec![],
            middlewares: vec![],
        })
        .await
        .unwrap();
}

struct CountingStrategy {
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl RegistrationStrategy for CountingStrategy {
    async fn register_app(&mut self, _app: &AppRegistration) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn register_handler(&mut self, _handler: &HandlerRegistration) -> Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_heartbeater_calls_on_interval() {
    let calls = Arc::new(AtomicUsize::new(0));
    let strategy = CountingStrategy {
        calls: calls.clone(),
    };

    let heartbeater = Heartbeater::start(app(8000), Box::new(strategy), Duration::from_secs(1));
    time::sleep(Duration::from_millis(3500)).await;
    heartbeater.stop().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeater_keeps_master_key() {
    let store = MemoryStore::new();
    let strategy = SingleMasterStrategy::new(Arc::new(store.clone()), NS, TTL);

    let heartbeater = Heartbeater::start(app(8000), Box::new(strategy), Duration::from_secs(1));
    time::sleep(Duration::from_secs(10)).await;
    assert!(store.get("/vulcand/backends/app1/servers/master").await.unwrap().is_some());

    heartbeater.stop().await.unwrap();
    time::sleep(TTL + Duration::from_secs(1)).await;
    assert!(store.get("/vulcand/backends/app1/servers/master").await.unwrap().is_none());
}
