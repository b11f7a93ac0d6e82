use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::get,
    Router,
};
use bigdecimal::BigDecimal;
use futures::{future, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::OrderView;
use crate::notifications::SubscriptionRegistry;
use crate::orders::{OrderError, PgOrders, PlaceOrder};

pub const ORDER_STATUS_EVENT: &str = "OrderStatusChanged";

#[derive(Clone)]
pub struct AppState {
    pub orders: PgOrders,
    pub notifications: SubscriptionRegistry,
    /// Ends open event streams so graceful shutdown can complete.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub user_id: Uuid,
    pub amount: BigDecimal,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOrdersQuery {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::InvalidAmount(_) | OrderError::DescriptionTooLong => {
                ApiError(StatusCode::BAD_REQUEST, err.to_string())
            }
            OrderError::Store(e) => {
                tracing::error!("Order storage failure: {}", e);
                ApiError(StatusCode::INTERNAL_SERVER_ERROR, "Failed to access orders".to_string())
            }
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/orders", get(list_orders).post(create_order))
        .route("/api/orders/:id", get(get_order))
        .route("/api/orders/:id/events", get(order_events))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Response, ApiError> {
    let command = PlaceOrder::new(request.user_id, request.amount, request.description)?;
    let order = state.orders.place(command).await?;

    let location = format!("/api/orders/{}", order.id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(OrderView::from(order)),
    )
        .into_response())
}

pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<Vec<OrderView>>, ApiError> {
    let orders = state.orders.list_by_user(query.user_id).await?;
    Ok(Json(orders.into_iter().map(OrderView::from).collect()))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderView>, ApiError> {
    match state.orders.get(order_id).await? {
        Some(order) => Ok(Json(order.into())),
        None => Err(ApiError(StatusCode::NOT_FOUND, format!("Order {} not found", order_id))),
    }
}

/// Streams status changes of one order as server-sent events.
pub async fn order_events(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.notifications.subscribe(order_id);
    let shutdown = state.shutdown.clone();
    let stream = subscription
        .take_until(async move { shutdown.cancelled().await })
        .filter_map(|notification| {
            future::ready(match Event::default().event(ORDER_STATUS_EVENT).json_data(&notification) {
                Ok(event) => Some(Ok(event)),
                Err(e) => {
                    tracing::warn!(order_id = %notification.id, "Failed to encode status event: {}", e);
                    None
                }
            })
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatusNotification;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
    use diesel_async::AsyncPgConnection;
    use tower::ServiceExt;

    // Requests in these tests never check a connection out of the pool.
    fn router(notifications: SubscriptionRegistry) -> Router {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new("postgres://unused/orders");
        let pool = Pool::builder().build_unchecked(manager);
        create_router(AppState {
            orders: PgOrders::new(pool),
            notifications,
            shutdown: CancellationToken::new(),
        })
    }

    async fn post_order(body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = router(SubscriptionRegistry::default())
            .oneshot(
                Request::post("/api/orders")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn rejects_non_positive_amount() {
        let (status, body) = post_order(serde_json::json!({
            "userId": Uuid::new_v4(),
            "amount": 0,
            "description": "Nothing"
        }))
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Amount must be positive");
    }

    #[tokio::test]
    async fn rejects_amounts_the_ledger_cannot_store() {
        for amount in ["0.001", "12345678901234567"] {
            let (status, _) = post_order(serde_json::json!({
                "userId": Uuid::new_v4(),
                "amount": amount,
                "description": "Nothing"
            }))
            .await;

            assert_eq!(status, StatusCode::BAD_REQUEST, "{amount}");
        }
    }

    #[tokio::test]
    async fn rejects_overlong_description() {
        let (status, _) = post_order(serde_json::json!({
            "userId": Uuid::new_v4(),
            "amount": "10.00",
            "description": "x".repeat(513)
        }))
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn listing_requires_a_user_id() {
        let response = router(SubscriptionRegistry::default())
            .oneshot(Request::get("/api/orders").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn event_stream_delivers_status_changes_for_the_order() {
        let notifications = SubscriptionRegistry::default();
        let order_id = Uuid::new_v4();

        let response = router(notifications.clone())
            .oneshot(
                Request::get(format!("/api/orders/{order_id}/events"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(notifications.subscriber_count(order_id), 1);

        notifications.publish(OrderStatusNotification {
            id: order_id,
            status: "Finished".to_string(),
        });

        let mut frames = response.into_body().into_data_stream();
        let frame = frames.next().await.unwrap().unwrap();
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.contains("event: OrderStatusChanged"), "{text}");
        assert!(text.contains(&format!(r#""id":"{order_id}""#)), "{text}");
        assert!(text.contains(r#""status":"Finished""#), "{text}");
    }

    #[tokio::test]
    async fn closing_the_event_stream_releases_the_subscription() {
        let notifications = SubscriptionRegistry::default();
        let order_id = Uuid::new_v4();

        let response = router(notifications.clone())
            .oneshot(
                Request::get(format!("/api/orders/{order_id}/events"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(notifications.subscriber_count(order_id), 1);

        drop(response);

        assert_eq!(notifications.subscriber_count(order_id), 0);
        assert_eq!(notifications.order_count(), 0);
    }
}
