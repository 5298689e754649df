use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/chain", web::get().to(handlers::get_chain))
            .route("/blocks/hash/{hash}", web::get().to(handlers::get_block_by_hash))
            .route("/blocks/{height}", web::get().to(handlers::get_block))
            // Registered before the hash lookup so "pending" is not read as a hash.
            .route("/transactions/pending", web::get().to(handlers::get_pending_transactions))
            .route("/transactions/sign", web::post().to(handlers::sign_transaction))
            .route("/transactions/{hash}", web::get().to(handlers::get_transaction))
            .route("/transactions", web::post().to(handlers::submit_transaction))
            .route("/mine", web::post().to(handlers::mine_block))
            .route("/mine/cancel", web::post().to(handlers::cancel_mining))
            .route("/validate", web::get().to(handlers::validate_chain))
            .route("/wallet/new", web::post().to(handlers::create_wallet))
            .route("/wallet/{address}/balance", web::get().to(handlers::get_wallet_balance))
            .route("/wallet/{address}/history", web::get().to(handlers::get_wallet_history)),
    );
}
