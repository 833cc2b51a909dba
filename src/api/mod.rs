//! API endpoints for the rate limiting service.
//!
//! This module provides the HTTP boundary that invokes the engine: the
//! admission check itself plus access-list management, status queries,
//! attack signature queries, and the cleanup trigger. All semantics live in
//! [`crate::core`]; handlers only translate between HTTP and the engine.

use std::sync::Arc;

use actix_web::{web, HttpResponse, Responder};
use log::error;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use crate::core::{RateLimitError, RateLimiter};
use crate::models::{Config, RateLimitRule};

pub struct ApiState {
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
    /// Prometheus render handle; `None` when the exporter is not installed
    pub metrics: Option<PrometheusHandle>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/check").route(web::post().to(check_rate_limit)))
            .service(web::resource("/whitelist").route(web::post().to(whitelist_ip)))
            .service(web::resource("/blacklist").route(web::post().to(blacklist_ip)))
            .service(web::resource("/status/{ip}").route(web::get().to(rate_limit_status)))
            .service(web::resource("/attacks").route(web::get().to(attack_signatures)))
            .service(web::resource("/cleanup").route(web::post().to(run_cleanup))),
    )
    .service(web::resource("/metrics").route(web::get().to(render_metrics)));
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Rate limit check request
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckRequest {
    pub rule: RateLimitRule,
    pub ip: String,
    pub user_id: Option<String>,
    pub endpoint: Option<String>,
}

/// Whitelist management request
#[derive(Debug, Serialize, Deserialize)]
pub struct WhitelistRequest {
    pub ip: String,
    /// Targeted rules; every rule when omitted
    pub rules: Option<Vec<RateLimitRule>>,
}

/// Blacklist management request
#[derive(Debug, Serialize, Deserialize)]
pub struct BlacklistRequest {
    pub ip: String,
    pub duration_minutes: u64,
}

/// Attack signature query parameters
#[derive(Debug, Deserialize)]
pub struct AttackQuery {
    #[serde(default)]
    pub active_only: bool,
}

fn internal_error(context: &str, e: RateLimitError) -> HttpResponse {
    error!("{}: {}", context, e);
    HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Rate limit check endpoint
async fn check_rate_limit(
    state: web::Data<ApiState>,
    req: web::Json<CheckRequest>,
) -> impl Responder {
    let decision = state
        .limiter
        .check_rate_limit(
            req.rule,
            &req.ip,
            req.user_id.as_deref(),
            req.endpoint.as_deref(),
        )
        .await;
    if decision.allowed {
        HttpResponse::Ok().json(decision)
    } else {
        HttpResponse::TooManyRequests().json(decision)
    }
}

/// Whitelist management endpoint
async fn whitelist_ip(
    state: web::Data<ApiState>,
    req: web::Json<WhitelistRequest>,
) -> impl Responder {
    match state
        .limiter
        .whitelist_ip(&req.ip, req.rules.as_deref())
        .await
    {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => internal_error("whitelist failed", e),
    }
}

/// Blacklist management endpoint (global temporary block)
async fn blacklist_ip(
    state: web::Data<ApiState>,
    req: web::Json<BlacklistRequest>,
) -> impl Responder {
    match state
        .limiter
        .blacklist_ip(&req.ip, req.duration_minutes)
        .await
    {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => internal_error("blacklist failed", e),
    }
}

/// Per-IP status endpoint
async fn rate_limit_status(state: web::Data<ApiState>, path: web::Path<String>) -> impl Responder {
    match state.limiter.get_rate_limit_status(&path).await {
        Ok(status) => HttpResponse::Ok().json(status),
        Err(e) => internal_error("status query failed", e),
    }
}

/// Attack signature query endpoint
async fn attack_signatures(
    state: web::Data<ApiState>,
    query: web::Query<AttackQuery>,
) -> impl Responder {
    match state.limiter.get_attack_signatures(query.active_only).await {
        Ok(signatures) => HttpResponse::Ok().json(signatures),
        Err(e) => internal_error("attack query failed", e),
    }
}

/// Manual cleanup trigger; the scheduler in main calls the engine directly
async fn run_cleanup(state: web::Data<ApiState>) -> impl Responder {
    match state.limiter.cleanup_expired_data().await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => internal_error("cleanup failed", e),
    }
}

/// Prometheus exposition endpoint
async fn render_metrics(state: web::Data<ApiState>) -> impl Responder {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}
