use axum::http::StatusCode;
use axum::response::IntoResponse;

/// Header stamped on heartbeat responses so load balancers can tell this
/// proxy apart from the origin.
pub const PROCESSED_BY_HEADER: &str = "X-LanCache-Processed-By";

/// `GET /lancache-heartbeat` handler.  Always `204 No Content`.
pub async fn heartbeat_handler() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, [(PROCESSED_BY_HEADER, "lancache")])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heartbeat_is_empty_no_content() {
        let resp = heartbeat_handler().await.into_response();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers()[PROCESSED_BY_HEADER], "lancache");
    }
}
