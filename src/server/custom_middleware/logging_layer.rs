use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{error, info, info_span, warn, Instrument};

pub async fn middleware(request: Request, next: Next) -> Response {
    let uri_path = request.uri().path().to_string();
    let request_method = request.method().clone();
    let request_query = request.uri().query().map(ToString::to_string);

    let span = info_span!("request", %uri_path, %request_method);

    async {
        info!(uri_path, %request_method, ?request_query, "Processing request");

        let response = next.run(request).await;

        let response_status = response.status();
        if response_status.is_server_error() {
            error!(uri_path, %request_method, %response_status, "Error processing request");
        } else if response_status.is_client_error() {
            warn!(uri_path, %request_method, %response_status, "Error processing request");
        } else {
            info!(uri_path, %request_method, %response_status, "Finished processing request");
        }

        response
    }
    .instrument(span)
    .await
}
