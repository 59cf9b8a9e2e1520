use crate::config::{AppConfig, SidecarMode};
use crate::relay::registry::RegistrySummary;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let sessions = state.registry.summary().await;
    let relay = state.metrics.snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voice-relay",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sidecar": {
            "mode": config.sidecar.mode,
            "url": match config.sidecar.mode {
                SidecarMode::Websocket => Some(config.sidecar.url.as_str()),
                SidecarMode::Loopback => None,
            },
            "sessions_by_state": sessions.by_connection_state
        },
        "relay": {
            "sessions_started": relay.sessions_started,
            "sessions_completed": relay.sessions_completed,
            "degraded_events": relay.degraded_events
        },
        "memory": get_memory_info(),
        "system": get_system_status(&config, &sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let relay = state.metrics.snapshot();
    let sessions = state.registry.summary().await;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "sessions": {
            "active": sessions.active_sessions,
            "max": sessions.max_sessions,
            "started": relay.sessions_started,
            "completed": relay.sessions_completed,
            "rejected": relay.sessions_rejected,
            "by_connection_state": sessions.by_connection_state
        },
        "audio": {
            "user_audio_ms": relay.user_audio_ms,
            "agent_audio_ms": relay.agent_audio_ms,
            "barge_in_frames": relay.barge_in_frames,
            "dropped_samples": relay.dropped_samples
        },
        "playback": {
            "underruns": relay.underruns,
            "overflows": relay.overflows
        },
        "failures": {
            "degraded_events": relay.degraded_events,
            "restored_events": relay.restored_events,
            "transcode_failures": relay.transcode_failures,
            "errors": relay.errors
        },
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "channel_capacity": config.performance.channel_capacity
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    let pid = process::id();

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let read_kb = |prefix: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(prefix))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "pid": pid,
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

fn get_system_status(config: &AppConfig, sessions: &RegistrySummary) -> serde_json::Value {
    let session_usage = if config.performance.max_concurrent_sessions > 0 {
        sessions.active_sessions as f64 / config.performance.max_concurrent_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": config.performance.max_concurrent_sessions,
        "current_sessions": sessions.active_sessions
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_service_and_load() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"]["name"], "voice-relay");
        assert_eq!(body["sidecar"]["mode"], "websocket");
        assert_eq!(body["system"]["current_sessions"], 0);
    }

    #[actix_web::test]
    async fn test_metrics_include_relay_counters() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        state.metrics.session_started();

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["sessions"]["started"], 1);
        assert_eq!(body["sessions"]["max"], 50);
        assert_eq!(body["playback"]["underruns"], 0);
    }
}
