use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder};
use prometheus::{Encoder, TextEncoder};
use tracing::error;

use eventrelay_lib::util::Metrics;

pub async fn serve_metrics(request: HttpRequest) -> impl Responder {
    let metrics = match request.app_data::<Arc<Metrics>>() {
        Some(metrics) => metrics,
        None => return HttpResponse::InternalServerError().finish(),
    };

    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok().content_type(encoder.format_type()).body(buffer)
}
