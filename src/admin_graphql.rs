use async_graphql::EmptySubscription;
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use sea_orm::DatabaseConnection;
use serde_json::json;
use std::sync::Arc;

use crate::admin_mutations::{AdminMutation, AdminQuery};
use crate::coordinator::RunCoordinator;

pub type AdminSchema = async_graphql::Schema<AdminQuery, AdminMutation, EmptySubscription>;

/// Build the admin GraphQL schema for registry and run management
pub fn build_schema(db: DatabaseConnection, coordinator: Arc<RunCoordinator>) -> AdminSchema {
    async_graphql::Schema::build(AdminQuery, AdminMutation, EmptySubscription)
        .data(Arc::new(db))
        .data(coordinator)
        .finish()
}

#[derive(Clone)]
pub struct AdminState {
    pub schema: AdminSchema,
}

/// GraphQL POST handler
async fn graphql_handler(State(state): State<Arc<AdminState>>, req: GraphQLRequest) -> GraphQLResponse {
    state.schema.execute(req.into_inner()).await.into()
}

/// GraphQL playground (GraphiQL) handler
async fn playground() -> impl IntoResponse {
    axum::response::Html(
        async_graphql::http::GraphiQLSource::build()
            .endpoint("/admin/graphql")
            .finish(),
    )
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Create the admin API router
pub fn router(schema: AdminSchema) -> Router {
    let state = Arc::new(AdminState { schema });

    Router::new()
        .route("/admin/graphql", post(graphql_handler))
        .route("/admin/playground", get(playground))
        .route("/health", get(health))
        .with_state(state)
}
