/**
 * HTTP API - Read-only operator surface of the kernel
 *
 * ROUTES :
 * - GET /health         liveness, always "ok"
 * - GET /system/health  uptime, bus counters, scraper states, MQTT, plugins
 * - GET /metrics        Prometheus text exposition (404 when the exporter is off)
 * - GET /plugins        supervised plugin processes
 */

use crate::bus::EventBus;
use crate::exporter::PrometheusExporter;
use crate::health::{HealthTracker, KernelHealth};
use crate::plugins::{PluginInfo, PluginManager};
use crate::scheduler::ScraperStates;
use crate::state::Shared;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tracing::warn;

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub scrapers: ScraperStates,
    pub health_tracker: HealthTracker,
    pub prometheus: Option<Arc<PrometheusExporter>>,
    pub plugins: Shared<PluginManager>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/metrics", get(get_metrics))
        .route("/plugins", get(list_plugins))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let plugins = app.plugins.lock().len();
    Json(app.health_tracker.get_health(app.bus.stats(), &app.scrapers, plugins))
}

// GET /metrics
async fn get_metrics(State(app): State<AppState>) -> Response {
    match &app.prometheus {
        Some(prom) => match prom.render() {
            Ok(text) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], text).into_response(),
            Err(e) => {
                warn!(error = %e, "cannot render metrics");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        },
        None => (StatusCode::NOT_FOUND, "prometheus exporter disabled").into_response(),
    }
}

// GET /plugins
async fn list_plugins(State(app): State<AppState>) -> Json<Vec<PluginInfo>> {
    Json(app.plugins.lock().list_plugins())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusOptions, Event};
    use crate::exporter::Exporter;
    use crate::models::{Instance, Provider};
    use crate::scheduler::ScraperState;
    use crate::state::new_state;
    use std::collections::BTreeMap;

    fn app(prometheus: Option<Arc<PrometheusExporter>>) -> AppState {
        AppState {
            bus: Arc::new(EventBus::new(BusOptions::default())),
            scrapers: new_state(BTreeMap::from([("lab".to_string(), ScraperState::Idle)])),
            health_tracker: HealthTracker::new(),
            prometheus,
            plugins: new_state(PluginManager::new("./plugins", None)),
        }
    }

    async fn body_text(res: Response) -> String {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_served_as_prometheus_text() {
        let prom = Arc::new(PrometheusExporter::new().unwrap());
        prom.send(&Instance::new("vm-1", Provider::Aws, "us-east-1", "t3.micro")).await.unwrap();

        let res = get_metrics(State(app(Some(prom)))).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], PROMETHEUS_CONTENT_TYPE);
        assert!(body_text(res).await.contains("instance=\"vm-1\""));
    }

    #[tokio::test]
    async fn test_metrics_missing_when_exporter_disabled() {
        let res = get_metrics(State(app(None))).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_system_health_reports_bus_and_scrapers() {
        let state = app(None);
        state.bus.start();
        state.bus.publish(Event::metrics_collected(Instance::new("vm-1", Provider::Gcp, "r", "k"))).await.unwrap();

        let Json(health) = get_system_health(State(state.clone())).await;
        assert_eq!(health.bus.published, 1);
        assert_eq!(health.scrapers["lab"], ScraperState::Idle);
        assert_eq!(health.plugins, 0);

        let Json(plugins) = list_plugins(State(state.clone())).await;
        assert!(plugins.is_empty());
        state.bus.stop().await;
    }
}
