pub mod audit_trail;
pub mod exchange_gateway;
pub mod settings_store;
pub mod trade_ledger;

pub use audit_trail::{AuditEntry, AuditEventType, AuditTrail};
pub use exchange_gateway::{ExchangeGateway, GatewayResult};
pub use settings_store::SettingsStore;
pub use trade_ledger::TradeLedger;
