//! Admin HTTP server: GraphQL API for registry and run management.
use crate::coordinator::RunCoordinator;
use crate::settings::Settings;
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use std::net::SocketAddr;
use std::sync::Arc;

pub async fn serve(
    settings: &Settings,
    db: DatabaseConnection,
    coordinator: Arc<RunCoordinator>,
) -> miette::Result<()> {
    let admin_addr: SocketAddr = format!("{}:{}", settings.admin.host, settings.admin.port)
        .parse()
        .map_err(|e| miette::miette!("bad admin addr: {e}"))?;

    let schema = crate::admin_graphql::build_schema(db, coordinator);
    let router = crate::admin_graphql::router(schema);

    let listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%admin_addr, "Admin GraphQL API listening");
    tracing::info!(
        "GraphQL Playground available at http://{}/admin/playground",
        admin_addr
    );

    axum::serve(listener, router).await.into_diagnostic()?;
    Ok(())
}
