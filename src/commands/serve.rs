use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use kube_lifecycle::api::{self, ApiState};
use kube_lifecycle::discovery::DiscoveryReconciler;
use kube_lifecycle::lease::LeaseManager;
use kube_lifecycle::model::{APP_PREFIX, ApplicationRecord};
use kube_lifecycle::orchestrator::Orchestrator;
use kube_lifecycle::probes::ec2::Ec2Instances;
use kube_lifecycle::probes::eks::EksNodePools;
use kube_lifecycle::probes::http::HttpPinger;
use kube_lifecycle::probes::kube::{KubePods, KubeTopology, KubeWorkloads};
use kube_lifecycle::schedule::ScheduleEvaluator;
use kube_lifecycle::status::{HttpStatus, StatusAggregator};
use kube_lifecycle::store::{DynamoStore, MemoryStore, Store};

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static DISCOVERY_RUNS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("lifecycle_discovery_runs_total", "Total discovery scans")
        .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static DISCOVERY_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "lifecycle_discovery_failures_total",
        "Total discovery scans that returned an error",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static SCHEDULER_TICKS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("lifecycle_scheduler_ticks_total", "Total schedule evaluator ticks")
        .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static SCHEDULER_ACTIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "lifecycle_scheduler_actions_total",
            "Lifecycle actions submitted by the scheduler",
        ),
        &["action"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static HEALTH_SWEEPS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("lifecycle_health_sweeps_total", "Total background health sweeps")
        .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static APP_HTTP_UP: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        prometheus::Opts::new(
            "lifecycle_app_http_up",
            "Last health sweep HTTP result per app (1=UP, 0=DOWN, -1=UNKNOWN)",
        ),
        &["app"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

/* ============================= STATE ============================= */

pub(crate) struct ServeState {
    pub(crate) ready: bool,
}

/* ============================= ENTRY ============================= */

pub async fn run(addr_str: &str, config_path: &str, memory_store: bool) -> Result<()> {
    println!("Starting lifecycle control plane...\n");

    let settings = super::load_settings(config_path)?;
    let clients = super::connect(&settings).await?;

    // Verify actual cluster connectivity before wiring anything else
    print!("  Cluster connection .......... ");
    match clients.kube.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let store: Arc<dyn Store> = if memory_store {
        println!("  Registry store .............. in-memory (volatile)");
        Arc::new(MemoryStore::new())
    } else {
        println!("  Registry store .............. dynamodb://{}", settings.store.table_name);
        Arc::new(DynamoStore::new(clients.dynamo.clone(), settings.store.table_name.clone()))
    };

    let instances = Arc::new(Ec2Instances::new(clients.ec2.clone()));
    let pools = Arc::new(EksNodePools::new(
        clients.eks.clone(),
        clients.kube.clone(),
        settings.cluster.name.clone(),
    ));
    let workloads = Arc::new(KubeWorkloads::new(clients.kube.clone()));
    let pods = Arc::new(KubePods::new(clients.kube.clone()));
    let topology = Arc::new(KubeTopology::new(clients.kube.clone()));
    let http = Arc::new(HttpPinger::new());

    let status = Arc::new(StatusAggregator::new(
        store.clone(),
        instances.clone(),
        pools.clone(),
        pods,
        http.clone(),
        settings.probe.clone(),
    ));
    let lease = Arc::new(LeaseManager::new(store.clone(), settings.lease.max_retries));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        instances.clone(),
        pools,
        workloads,
        http,
        status.clone(),
        lease,
        Duration::from_secs(settings.lease.ttl_seconds.max(1) as u64),
        Duration::from_secs(settings.probe.quick_timeout),
        Duration::from_secs(settings.probe.http_timeout),
    ));
    let discovery = Arc::new(DiscoveryReconciler::new(
        store.clone(),
        topology,
        instances,
        settings.clone(),
    ));
    let evaluator = Arc::new(ScheduleEvaluator::new(
        store.clone(),
        status.clone(),
        orchestrator.clone(),
        settings.global_schedule.clone(),
    ));

    let api_state = ApiState {
        store: store.clone(),
        status: status.clone(),
        orchestrator,
        discovery: discovery.clone(),
        schedule: settings.global_schedule.clone(),
    };

    // Force-init Prometheus metrics so they appear on /metrics
    LazyLock::force(&DISCOVERY_RUNS);
    LazyLock::force(&DISCOVERY_FAILURES);
    LazyLock::force(&SCHEDULER_TICKS);
    LazyLock::force(&SCHEDULER_ACTIONS);
    LazyLock::force(&HEALTH_SWEEPS);
    LazyLock::force(&APP_HTTP_UP);

    let addr: SocketAddr = addr_str.parse().context("Invalid address format")?;

    println!("  Cluster name ................ {}", settings.cluster.name);
    println!(
        "  Discovery interval .......... {}s",
        settings.schedules.discovery
    );
    println!(
        "  Scheduler interval .......... {}s",
        settings.schedules.scheduler
    );
    println!("  API server .................. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET  /apps ................ All apps with live status");
    println!("    GET  /apps/{{name}} ......... One composite view");
    println!("    POST /start ............... Start machine (?dry_run=true)");
    println!("    POST /stop ................ Stop machine");
    println!("    POST /db/start /db/stop ... DB-only lifecycle");
    println!("    GET  /status/quick ........ HEAD-only quick status");
    println!("    GET  /metrics ............. Prometheus metrics");
    println!();
    println!("Control plane running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("control_plane_started");

    let serve_state = Arc::new(Mutex::new(ServeState { ready: false }));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let app = api::build_router(api_state).merge(build_ops_router(serve_state.clone()));
    let http_shutdown = shutdown_tx.subscribe();
    let mut http_handle =
        tokio::spawn(async move { start_api_server(app, http_shutdown, addr).await });

    // ── Background loops ──
    let discovery_handle = tokio::spawn(run_discovery_loop(
        discovery,
        serve_state.clone(),
        settings.schedules.discovery_interval(),
    ));
    let scheduler_handle = tokio::spawn(run_scheduler_loop(
        evaluator,
        settings.schedules.scheduler_interval(),
    ));
    let health_handle = tokio::spawn(run_health_loop(
        store,
        status,
        settings.schedules.health_interval(),
    ));

    tokio::select! {
        result = &mut http_handle => {
            warn!("api_server_ended");
            result??;
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping control plane...");
            println!("{}", "=".repeat(70));

            let _ = shutdown_tx.send(());
            let _ = http_handle.await?;
        }
    }

    discovery_handle.abort();
    scheduler_handle.abort();
    health_handle.abort();

    info!("control_plane_stopped");
    println!("Control plane stopped.");
    Ok(())
}

/* ============================= BACKGROUND LOOPS ============================= */

async fn run_discovery_loop(
    discovery: Arc<DiscoveryReconciler>,
    state: Arc<Mutex<ServeState>>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        DISCOVERY_RUNS.inc();
        match discovery.run_scan().await {
            Ok(summary) => {
                println!(
                    "[{}] discovery: {} apps, {} written, {} failures",
                    Utc::now().format("%H:%M:%S"),
                    summary.apps_seen,
                    summary.apps_written,
                    summary.failures.len()
                );
                let mut s = state.lock().await;
                s.ready = true;
            }
            Err(e) => {
                DISCOVERY_FAILURES.inc();
                warn!(error = %e, "discovery_scan_failed");
            }
        }
    }
}

async fn run_scheduler_loop(evaluator: Arc<ScheduleEvaluator>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it so a restart right after a
    // boundary does not replay the boundary.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        SCHEDULER_TICKS.inc();
        match evaluator.evaluate_tick(Utc::now()).await {
            Ok(report) => {
                SCHEDULER_ACTIONS
                    .with_label_values(&["start"])
                    .inc_by(report.started.len() as u64);
                SCHEDULER_ACTIONS
                    .with_label_values(&["stop"])
                    .inc_by(report.stopped.len() as u64);
                if !report.started.is_empty() || !report.stopped.is_empty() {
                    println!(
                        "[{}] scheduler: started {:?}, stopped {:?}",
                        Utc::now().format("%H:%M:%S"),
                        report.started,
                        report.stopped
                    );
                }
            }
            Err(e) => warn!(error = %e, "scheduler_tick_failed"),
        }
    }
}

/// Observability sweep: exports each app's quick status as a gauge. The
/// registry is never updated from here — live reads stay live.
async fn run_health_loop(
    store: Arc<dyn Store>,
    status: Arc<StatusAggregator>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        HEALTH_SWEEPS.inc();

        let apps = match store.scan_prefix(APP_PREFIX).await {
            Ok(apps) => apps,
            Err(e) => {
                warn!(error = %e, "health_sweep_scan_failed");
                continue;
            }
        };

        for (_, doc) in apps {
            let Ok(record) = serde_json::from_value::<ApplicationRecord>(doc) else {
                continue;
            };
            let quick = status
                .quick_status_for_host(&record.app_name, record.primary_hostname())
                .await;
            let value = match quick.status {
                HttpStatus::Up => 1,
                HttpStatus::Down => 0,
                HttpStatus::Unknown => -1,
            };
            APP_HTTP_UP.with_label_values(&[&record.app_name]).set(value);
        }
    }
}

/* ============================= OPS ROUTER ============================= */

pub(crate) fn build_ops_router(state: Arc<Mutex<ServeState>>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
        .route("/metrics", get(metrics_handler))
}

async fn start_api_server(
    app: Router,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API server on {addr}"))?;

    info!(addr = %addr, "api_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(state: Arc<Mutex<ServeState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "metrics encoding error".to_string(),
            ),
        },
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(ready: bool) -> Arc<Mutex<ServeState>> {
        Arc::new(Mutex::new(ServeState { ready }))
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let app = build_ops_router(test_state(false));
        let req = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_readyz_before_first_discovery() {
        let app = build_ops_router(test_state(false));
        let req = Request::builder()
            .uri("/readyz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_after_discovery() {
        let app = build_ops_router(test_state(true));
        let req = Request::builder()
            .uri("/readyz")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_returns_ok() {
        let app = build_ops_router(test_state(false));
        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
