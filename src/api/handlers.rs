use std::sync::Arc;

use actix_web::{http::StatusCode, web, HttpResponse, Responder};
use log::{error, info};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::blockchain::{
    Address, Block, Blockchain, BlockchainError, CancelFlag, ChainError, HistoryEntry, MinerError,
    PoolError, Transaction, Wallet,
};

/// Page size used when the caller gives none
const DEFAULT_PAGE_LIMIT: usize = 100;

/// Shared state handed to every handler
pub struct AppState {
    pub blockchain: Arc<Blockchain>,
}

impl AppState {
    pub fn new(blockchain: Arc<Blockchain>) -> Self {
        AppState { blockchain }
    }
}

/// Data structure for the blockchain state
pub type AppData = web::Data<AppState>;

/// Offset/limit pagination
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct Pagination {
    /// Number of items to skip
    pub offset: Option<usize>,

    /// Maximum number of items to return
    pub limit: Option<usize>,
}

impl Pagination {
    fn bounds(&self) -> (usize, usize) {
        (self.offset.unwrap_or(0), self.limit.unwrap_or(DEFAULT_PAGE_LIMIT))
    }
}

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// The requested page of blocks
    pub blocks: Vec<Block>,
}

/// Request for the transaction signing endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    /// The recipient's address
    pub recipient: String,

    /// The amount to transfer
    pub amount: f64,

    /// The sender's private key, hex encoded (development only)
    pub private_key: String,
}

/// Response for the transaction endpoints
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionResponse {
    /// The message
    pub message: String,

    /// The accepted transaction
    pub transaction: Transaction,
}

/// A mined transaction with the height of its block
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MinedTransactionResponse {
    pub block_index: u64,
    pub transaction: Transaction,
}

/// Request for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineRequest {
    /// The miner's address
    pub miner_address: String,

    /// Overrides the configured difficulty for this block
    pub difficulty: Option<u8>,
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineResponse {
    /// The message
    pub message: String,

    /// The newly mined block
    pub block: Block,
}

/// Response for the validate endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ValidationResponse {
    pub valid: bool,

    /// Index of the first block that breaks the chain rules
    pub block_index: Option<u64>,

    pub error: Option<String>,
}

/// Response for the create wallet endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct WalletResponse {
    /// The wallet's address
    pub address: String,

    /// The wallet's public key (base58)
    pub public_key: String,

    /// The wallet's private key (hex encoded)
    pub private_key: String,
}

/// Response for the balance endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    pub address: String,
    pub balance: f64,
}

fn error_response(err: &BlockchainError) -> HttpResponse {
    let status = match err {
        BlockchainError::InsufficientFunds { .. } | BlockchainError::Pool(_) => StatusCode::BAD_REQUEST,
        BlockchainError::Miner(MinerError::EmptyPool { .. })
        | BlockchainError::Miner(MinerError::InvalidDifficulty(_)) => StatusCode::BAD_REQUEST,
        BlockchainError::Chain(ChainError::NotFound(_)) => StatusCode::NOT_FOUND,
        BlockchainError::Chain(_) | BlockchainError::Ledger(_) | BlockchainError::Miner(_) => {
            StatusCode::CONFLICT
        }
        BlockchainError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!("Request failed: {}", err);
    }

    let kind = match err {
        BlockchainError::InsufficientFunds { .. } => "insufficient_funds",
        BlockchainError::Pool(PoolError::Duplicate(_)) => "duplicate",
        BlockchainError::Pool(PoolError::InvalidTransaction(_)) => "invalid",
        BlockchainError::Pool(PoolError::Signature(_)) => "signature",
        BlockchainError::Chain(ChainError::NotFound(_)) => "not_found",
        BlockchainError::Chain(_) => "chain",
        BlockchainError::Miner(_) => "mining",
        BlockchainError::Ledger(_) => "ledger_inconsistency",
        BlockchainError::Storage(_) => "storage",
    };

    HttpResponse::build(status).json(serde_json::json!({
        "error": err.to_string(),
        "kind": kind,
    }))
}

fn bad_request(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({ "error": message, "kind": "invalid" }))
}

fn parse_address(raw: &str) -> Result<Address, HttpResponse> {
    raw.parse::<Address>()
        .map_err(|err| bad_request(format!("Invalid address {}: {}", raw, err)))
}

/// Get a page of the blockchain
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    params(Pagination),
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = ChainResponse)
    )
)]
pub async fn get_chain(state: AppData, page: web::Query<Pagination>) -> impl Responder {
    let (offset, limit) = page.bounds();
    let (length, blocks) = state.blockchain.chain_page(offset, limit);
    let response = ChainResponse { length, blocks };

    HttpResponse::Ok().json(response)
}

/// Get a block by height
#[utoipa::path(
    get,
    path = "/api/v1/blocks/{height}",
    params(("height" = u64, Path, description = "Block height")),
    responses(
        (status = 200, description = "Block found", body = Block),
        (status = 404, description = "No block at this height")
    )
)]
pub async fn get_block(state: AppData, height: web::Path<u64>) -> impl Responder {
    match state.blockchain.block_at(height.into_inner()) {
        Ok(block) => HttpResponse::Ok().json(block),
        Err(err) => error_response(&err),
    }
}

/// Get a block by hash
#[utoipa::path(
    get,
    path = "/api/v1/blocks/hash/{hash}",
    params(("hash" = String, Path, description = "Block hash")),
    responses(
        (status = 200, description = "Block found", body = Block),
        (status = 404, description = "No block with this hash")
    )
)]
pub async fn get_block_by_hash(state: AppData, hash: web::Path<String>) -> impl Responder {
    match state.blockchain.block_by_hash(&hash) {
        Ok(block) => HttpResponse::Ok().json(block),
        Err(err) => error_response(&err),
    }
}

/// Get a mined transaction by hash
#[utoipa::path(
    get,
    path = "/api/v1/transactions/{hash}",
    params(("hash" = String, Path, description = "Transaction hash")),
    responses(
        (status = 200, description = "Transaction found", body = MinedTransactionResponse),
        (status = 404, description = "No mined transaction with this hash")
    )
)]
pub async fn get_transaction(state: AppData, hash: web::Path<String>) -> impl Responder {
    match state.blockchain.transaction(&hash) {
        Ok((block_index, transaction)) => HttpResponse::Ok().json(MinedTransactionResponse {
            block_index,
            transaction,
        }),
        Err(err) => error_response(&err),
    }
}

/// Get all pending transactions
///
/// Returns all transactions waiting to be included in a block
#[utoipa::path(
    get,
    path = "/api/v1/transactions/pending",
    responses(
        (status = 200, description = "Pending transactions retrieved successfully", body = Vec<Transaction>)
    )
)]
pub async fn get_pending_transactions(state: AppData) -> impl Responder {
    HttpResponse::Ok().json(state.blockchain.get_pending_transactions())
}

/// Submit a signed transaction
#[utoipa::path(
    post,
    path = "/api/v1/transactions",
    request_body = Transaction,
    responses(
        (status = 201, description = "Transaction accepted", body = TransactionResponse),
        (status = 400, description = "Duplicate, invalid or unfunded transaction")
    )
)]
pub async fn submit_transaction(state: AppData, transaction: web::Json<Transaction>) -> impl Responder {
    accept(&state, transaction.into_inner())
}

/// Sign and submit a transfer with a private key
///
/// Development helper: the private key travels to the node.
#[utoipa::path(
    post,
    path = "/api/v1/transactions/sign",
    request_body = TransactionRequest,
    responses(
        (status = 201, description = "Transaction created successfully", body = TransactionResponse),
        (status = 400, description = "Invalid transaction data")
    )
)]
pub async fn sign_transaction(state: AppData, request: web::Json<TransactionRequest>) -> impl Responder {
    let recipient = match parse_address(&request.recipient) {
        Ok(address) => address,
        Err(response) => return response,
    };

    let private_key_bytes = match hex::decode(&request.private_key) {
        Ok(bytes) => bytes,
        Err(_) => return bad_request("Invalid private key format. Must be a hex string.".to_string()),
    };

    let wallet = match Wallet::from_secret_key(&private_key_bytes) {
        Ok(wallet) => wallet,
        Err(err) => return bad_request(format!("Invalid private key: {}", err)),
    };

    let transaction = Transaction::transfer(&wallet, recipient, request.amount);
    accept(&state, transaction)
}

fn accept(state: &AppState, transaction: Transaction) -> HttpResponse {
    match state.blockchain.submit_transaction(transaction) {
        Ok(transaction) => HttpResponse::Created().json(TransactionResponse {
            message: "Transaction added to the pool".to_string(),
            transaction,
        }),
        Err(err) => error_response(&err),
    }
}

/// Mine a new block
///
/// Creates a new block from pending transactions
#[utoipa::path(
    post,
    path = "/api/v1/mine",
    request_body = MineRequest,
    responses(
        (status = 200, description = "Block mined successfully", body = MineResponse),
        (status = 400, description = "Invalid mining request"),
        (status = 409, description = "Mining cancelled or chain rejected the block")
    )
)]
pub async fn mine_block(state: AppData, request: web::Json<MineRequest>) -> impl Responder {
    let miner = match parse_address(&request.miner_address) {
        Ok(address) => address,
        Err(response) => return response,
    };
    let difficulty = request.difficulty;

    // Registered with the service only once this round holds the mining lock.
    let cancel = CancelFlag::new();

    // The nonce search is CPU bound; keep it off the async workers.
    let blockchain = Arc::clone(&state.blockchain);
    let result = web::block(move || blockchain.mine_block(&miner, difficulty, &cancel)).await;

    match result {
        Ok(Ok(block)) => HttpResponse::Ok().json(MineResponse {
            message: "New Block Mined".to_string(),
            block,
        }),
        Ok(Err(err)) => error_response(&err),
        Err(err) => {
            error!("Mining task failed: {}", err);
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "Mining task failed",
                "kind": "internal",
            }))
        }
    }
}

/// Cancel the mining round in flight
#[utoipa::path(
    post,
    path = "/api/v1/mine/cancel",
    responses(
        (status = 202, description = "Cancellation requested"),
        (status = 404, description = "No mining round in progress")
    )
)]
pub async fn cancel_mining(state: AppData) -> impl Responder {
    if !state.blockchain.cancel_mining() {
        return HttpResponse::NotFound().json(serde_json::json!({
            "error": "No mining round in progress"
        }));
    }
    info!("Mining cancellation requested");

    HttpResponse::Accepted().json(serde_json::json!({ "message": "Cancellation requested" }))
}

/// Check if the blockchain is valid
///
/// Validates the entire blockchain and reports the first bad block
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = ValidationResponse)
    )
)]
pub async fn validate_chain(state: AppData) -> impl Responder {
    let response = match state.blockchain.validate() {
        Ok(()) => ValidationResponse {
            valid: true,
            block_index: None,
            error: None,
        },
        Err(err) => ValidationResponse {
            valid: false,
            block_index: match &err {
                BlockchainError::Chain(chain_err) => chain_err.block_index(),
                _ => None,
            },
            error: Some(err.to_string()),
        },
    };

    HttpResponse::Ok().json(response)
}

/// Create a new wallet
///
/// Creates a new wallet with a random keypair
///
/// The private key must be stored by your own
#[utoipa::path(
    post,
    path = "/api/v1/wallet/new",
    responses(
        (status = 201, description = "Wallet created successfully", body = WalletResponse)
    )
)]
pub async fn create_wallet() -> impl Responder {
    let wallet = Wallet::new();

    HttpResponse::Created().json(WalletResponse {
        address: wallet.address().0.clone(),
        public_key: wallet.public_key().0.clone(),
        private_key: hex::encode(wallet.export_secret_key()),
    })
}

/// Get wallet balance
///
/// Returns the balance of a wallet, replayed from the chain
#[utoipa::path(
    get,
    path = "/api/v1/wallet/{address}/balance",
    params(("address" = String, Path, description = "Wallet address")),
    responses(
        (status = 200, description = "Wallet balance retrieved successfully", body = BalanceResponse),
        (status = 400, description = "Invalid address"),
        (status = 409, description = "Ledger inconsistency")
    )
)]
pub async fn get_wallet_balance(state: AppData, address: web::Path<String>) -> impl Responder {
    let address = match parse_address(&address) {
        Ok(address) => address,
        Err(response) => return response,
    };

    match state.blockchain.balance_of(&address) {
        Ok(balance) => HttpResponse::Ok().json(BalanceResponse {
            address: address.0,
            balance,
        }),
        Err(err) => error_response(&err),
    }
}

/// Get wallet history
///
/// Returns every movement touching a wallet, newest first
#[utoipa::path(
    get,
    path = "/api/v1/wallet/{address}/history",
    params(("address" = String, Path, description = "Wallet address"), Pagination),
    responses(
        (status = 200, description = "Wallet history retrieved successfully", body = Vec<HistoryEntry>),
        (status = 400, description = "Invalid address")
    )
)]
pub async fn get_wallet_history(
    state: AppData,
    address: web::Path<String>,
    page: web::Query<Pagination>,
) -> impl Responder {
    let address = match parse_address(&address) {
        Ok(address) => address,
        Err(response) => return response,
    };
    let (offset, limit) = page.bounds();

    let history: Vec<HistoryEntry> = state
        .blockchain
        .history_of(&address)
        .into_iter()
        .skip(offset)
        .take(limit)
        .collect();

    HttpResponse::Ok().json(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure_routes;
    use crate::config::LedgerConfig;
    use actix_web::{test, App};

    fn state() -> AppData {
        web::Data::new(AppState::new(Arc::new(Blockchain::new(LedgerConfig::with_difficulty(1)))))
    }

    #[actix_web::test]
    async fn test_mine_then_query_balance() {
        let state = state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure_routes)).await;
        let wallet = Wallet::new();

        let req = test::TestRequest::post()
            .uri("/api/v1/mine")
            .set_json(serde_json::json!({ "miner_address": wallet.address().0 }))
            .to_request();
        let mined: MineResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(mined.block.index, 1);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/wallet/{}/balance", wallet.address()))
            .to_request();
        let balance: BalanceResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(balance.balance, 50.0);
    }

    #[actix_web::test]
    async fn test_signed_transaction_flow() {
        let state = state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure_routes)).await;
        let alice = Wallet::new();
        let bob = Wallet::new();
        state
            .blockchain
            .mine_block(alice.address(), None, &CancelFlag::new())
            .unwrap();

        let tx = Transaction::transfer(&alice, bob.address().clone(), 10.0);
        let req = test::TestRequest::post().uri("/api/v1/transactions").set_json(&tx).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        // Same transaction again is a duplicate.
        let req = test::TestRequest::post().uri("/api/v1/transactions").set_json(&tx).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get().uri("/api/v1/transactions/pending").to_request();
        let pending: Vec<Transaction> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(pending, vec![tx]);
    }

    #[actix_web::test]
    async fn test_lookup_errors() {
        let app = test::init_service(App::new().app_data(state()).configure(configure_routes)).await;

        let req = test::TestRequest::get().uri("/api/v1/blocks/42").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get().uri("/api/v1/wallet/not-an-address/balance").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get().uri("/api/v1/validate").to_request();
        let validation: ValidationResponse = test::call_and_read_body_json(&app, req).await;
        assert!(validation.valid);
    }

    #[actix_web::test]
    async fn test_cancel_without_a_round_is_not_found() {
        let state = state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure_routes)).await;

        let req = test::TestRequest::post().uri("/api/v1/mine/cancel").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        // The next round starts with a fresh flag and still mines.
        let req = test::TestRequest::post()
            .uri("/api/v1/mine")
            .set_json(serde_json::json!({ "miner_address": Wallet::new().address().0 }))
            .to_request();
        let mined: MineResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(mined.block.index, 1);
    }

    #[actix_web::test]
    async fn test_chain_page_reports_total_length() {
        let state = state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure_routes)).await;
        let miner = Wallet::new();
        for _ in 0..2 {
            state
                .blockchain
                .mine_block(miner.address(), None, &CancelFlag::new())
                .unwrap();
        }

        let req = test::TestRequest::get().uri("/api/v1/chain?offset=1&limit=1").to_request();
        let page: ChainResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(page.length, 3);
        assert_eq!(page.blocks.len(), 1);
        assert_eq!(page.blocks[0].index, 1);
    }
}
