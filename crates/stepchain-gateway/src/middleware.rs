use axum::body::Body;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use futures::StreamExt;
use tracing::debug;

use stepchain_engine::AfterResponse;

/// Gives every request an [`AfterResponse`] and releases whatever the
/// handler deferred once the response body has been fully handed to the
/// connection (the body stream is dropped).
pub async fn after_response(mut req: Request, next: Next) -> Response {
    let deferred = AfterResponse::new();
    req.extensions_mut().insert(deferred.clone());

    let response = next.run(req).await;
    if deferred.is_empty() {
        return response;
    }

    debug!(labels = ?deferred.labels(), "Holding deferred actions until the response is sent");
    let guard = deferred.release_on_drop();
    let (parts, body) = response.into_parts();
    let body = body.into_data_stream().map(move |chunk| {
        let _ = &guard;
        chunk
    });
    Response::from_parts(parts, Body::from_stream(body))
}
