//! Repository layer for data access

pub mod campaigns;
pub mod recipients;
pub mod sender_accounts;
pub mod templates;
pub mod threads;
pub mod wallets;

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use std::sync::Arc;

// Re-export repository traits
pub use campaigns::CampaignRepository;
pub use recipients::RecipientRepository;
pub use sender_accounts::SenderAccountRepository;
pub use templates::TemplateRepository;
pub use threads::ThreadRepository;
pub use wallets::WalletRepository;

// Re-export database implementations
pub use campaigns::DbCampaignRepository;
pub use recipients::DbRecipientRepository;
pub use sender_accounts::DbSenderAccountRepository;
pub use templates::DbTemplateRepository;
pub use threads::DbThreadRepository;
pub use wallets::DbWalletRepository;

/// The set of repositories the dispatch engine works against
#[derive(Clone)]
pub struct Repositories {
    pub campaigns: Arc<dyn CampaignRepository>,
    pub recipients: Arc<dyn RecipientRepository>,
    pub sender_accounts: Arc<dyn SenderAccountRepository>,
    pub templates: Arc<dyn TemplateRepository>,
    pub threads: Arc<dyn ThreadRepository>,
    pub wallets: Arc<dyn WalletRepository>,
}

impl Repositories {
    /// Postgres-backed repositories sharing one pool
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            campaigns: Arc::new(DbCampaignRepository::new(pool.clone())),
            recipients: Arc::new(DbRecipientRepository::new(pool.clone())),
            sender_accounts: Arc::new(DbSenderAccountRepository::new(pool.clone())),
            templates: Arc::new(DbTemplateRepository::new(pool.clone())),
            threads: Arc::new(DbThreadRepository::new(pool.clone())),
            wallets: Arc::new(DbWalletRepository::new(pool)),
        }
    }

    /// Every repository backed by the same in-memory store
    pub fn memory(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        Self {
            campaigns: store.clone(),
            recipients: store.clone(),
            sender_accounts: store.clone(),
            templates: store.clone(),
            threads: store.clone(),
            wallets: store,
        }
    }
}
