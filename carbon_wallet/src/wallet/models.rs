//! Wallet data models.

use super::errors::{WalletError, WalletResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// User ID type
pub type UserId = Uuid;

/// Fractional digits kept by the ledger (matches `NUMERIC(20, 6)`).
pub const AMOUNT_SCALE: u32 = 6;

/// Exclusive upper bound for amounts and balances; `NUMERIC(20, 6)` keeps
/// 14 integer digits.
pub const AMOUNT_LIMIT: Decimal = Decimal::from_parts(276_447_232, 23_283, 0, false, 0);

/// Reject non-positive amounts, amounts finer than [`AMOUNT_SCALE`] and
/// amounts at or above [`AMOUNT_LIMIT`].
pub fn validate_amount(amount: Decimal) -> WalletResult<Decimal> {
    if amount <= Decimal::ZERO
        || amount >= AMOUNT_LIMIT
        || amount.normalize().scale() > AMOUNT_SCALE
    {
        return Err(WalletError::InvalidAmount(amount));
    }
    Ok(amount.normalize())
}

/// Wallet model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: UserId,
    pub available_credits: Decimal,
    /// Reserved for future use; always zero.
    pub pending_credits: Decimal,
    pub total_earned: Decimal,
    pub total_spent: Decimal,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    /// Empty wallet for a user seen for the first time
    pub fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            available_credits: Decimal::ZERO,
            pending_credits: Decimal::ZERO,
            total_earned: Decimal::ZERO,
            total_spent: Decimal::ZERO,
            last_updated: now,
            created_at: now,
        }
    }

    /// `available == earned - spent` and `available >= 0`
    pub fn is_consistent(&self) -> bool {
        self.available_credits >= Decimal::ZERO
            && self.pending_credits >= Decimal::ZERO
            && self.available_credits == self.total_earned - self.total_spent
    }

    /// Totals stay below [`AMOUNT_LIMIT`]; the wallet is untouched on error.
    pub(crate) fn apply_credit(&mut self, amount: Decimal, at: DateTime<Utc>) -> WalletResult<Decimal> {
        let total_earned = bounded_sum(self.total_earned, amount)?;
        self.settle(total_earned, self.total_spent, at)
    }

    pub(crate) fn apply_debit(&mut self, amount: Decimal, at: DateTime<Utc>) -> WalletResult<Decimal> {
        let total_spent = bounded_sum(self.total_spent, amount)?;
        self.settle(self.total_earned, total_spent, at)
    }

    fn settle(
        &mut self,
        total_earned: Decimal,
        total_spent: Decimal,
        at: DateTime<Utc>,
    ) -> WalletResult<Decimal> {
        let available = total_earned
            .checked_sub(total_spent)
            .ok_or_else(|| WalletError::Validation("wallet balance out of range".to_string()))?;
        self.total_earned = total_earned;
        self.total_spent = total_spent;
        self.available_credits = available;
        self.last_updated = at;
        Ok(available)
    }
}

fn bounded_sum(total: Decimal, amount: Decimal) -> WalletResult<Decimal> {
    total
        .checked_add(amount)
        .filter(|sum| *sum < AMOUNT_LIMIT)
        .ok_or_else(|| {
            WalletError::Validation(format!("wallet total would reach the limit of {AMOUNT_LIMIT}"))
        })
}

/// Balance snapshot returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
    pub user_id: UserId,
    pub available: Decimal,
    pub pending: Decimal,
    pub total_earned: Decimal,
    pub total_spent: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl From<&Wallet> for BalanceView {
    fn from(wallet: &Wallet) -> Self {
        Self {
            user_id: wallet.user_id,
            available: wallet.available_credits,
            pending: wallet.pending_credits,
            total_earned: wallet.total_earned,
            total_spent: wallet.total_spent,
            last_updated: wallet.last_updated,
        }
    }
}

/// Transaction type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    CreditEarned,
    CreditSpent,
    TransferIn,
    TransferOut,
    Adjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::CreditEarned => "credit_earned",
            TransactionType::CreditSpent => "credit_spent",
            TransactionType::TransferIn => "transfer_in",
            TransactionType::TransferOut => "transfer_out",
            TransactionType::Adjustment => "adjustment",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit_earned" => Ok(TransactionType::CreditEarned),
            "credit_spent" => Ok(TransactionType::CreditSpent),
            "transfer_in" => Ok(TransactionType::TransferIn),
            "transfer_out" => Ok(TransactionType::TransferOut),
            "adjustment" => Ok(TransactionType::Adjustment),
            other => Err(WalletError::Storage(format!(
                "unknown transaction type {other}"
            ))),
        }
    }
}

/// Transaction status
///
/// `Pending` may move to any of the other three; those are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        matches!(self, TransactionStatus::Pending) && next.is_terminal()
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            "cancelled" => Ok(TransactionStatus::Cancelled),
            other => Err(WalletError::Storage(format!(
                "unknown transaction status {other}"
            ))),
        }
    }
}

/// Typed metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetadataValue {
    Text(String),
    Number(Decimal),
    Flag(bool),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<Decimal> for MetadataValue {
    fn from(value: Decimal) -> Self {
        MetadataValue::Number(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Flag(value)
    }
}

/// Ordered key/value association list attached to a transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Vec<(String, MetadataValue)>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Metadata::set`]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Insert or replace `key`, keeping the original position on replace
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Ledger transaction. Immutable once completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: UserId,
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub source: String,
    pub description: String,
    pub reference_id: String,
    pub from_user_id: Option<UserId>,
    pub to_user_id: Option<UserId>,
    pub metadata: Metadata,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Completed record with empty text fields; `processed_at` is stamped by
    /// the store at commit
    pub fn completed(
        user_id: UserId,
        tx_type: TransactionType,
        amount: Decimal,
        balance_after: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            tx_type,
            status: TransactionStatus::Completed,
            amount,
            balance_after,
            source: String::new(),
            description: String::new(),
            reference_id: String::new(),
            from_user_id: None,
            to_user_id: None,
            metadata: Metadata::new(),
            processed_at: None,
            created_at,
        }
    }
}

/// Idempotency key of a transaction: one completed record per triple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReferenceKey {
    pub user_id: UserId,
    pub reference_id: String,
    pub tx_type: TransactionType,
}

impl ReferenceKey {
    /// `None` when the caller supplied no reference, which disables replay detection
    pub fn new(user_id: UserId, reference_id: &str, tx_type: TransactionType) -> Option<Self> {
        if reference_id.trim().is_empty() {
            return None;
        }
        Some(Self {
            user_id,
            reference_id: reference_id.to_string(),
            tx_type,
        })
    }

    pub fn matches(&self, tx: &Transaction) -> bool {
        tx.status == TransactionStatus::Completed
            && tx.user_id == self.user_id
            && tx.tx_type == self.tx_type
            && tx.reference_id == self.reference_id
    }
}

/// Credit request
#[derive(Debug, Clone)]
pub struct CreditRequest {
    pub user_id: UserId,
    pub amount: Decimal,
    pub source: String,
    pub description: String,
    pub reference_id: String,
    pub metadata: Metadata,
}

impl CreditRequest {
    pub fn new(user_id: UserId, amount: Decimal, source: impl Into<String>) -> Self {
        Self {
            user_id,
            amount,
            source: source.into(),
            description: String::new(),
            reference_id: String::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = reference_id.into();
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Debit request
#[derive(Debug, Clone)]
pub struct DebitRequest {
    pub user_id: UserId,
    pub amount: Decimal,
    pub description: String,
    pub reference_id: String,
    pub metadata: Metadata,
}

impl DebitRequest {
    pub fn new(user_id: UserId, amount: Decimal) -> Self {
        Self {
            user_id,
            amount,
            description: String::new(),
            reference_id: String::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = reference_id.into();
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Direction of a manual adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentDirection {
    Increase,
    Decrease,
}

impl AdjustmentDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentDirection::Increase => "increase",
            AdjustmentDirection::Decrease => "decrease",
        }
    }

    /// Inverse of [`AdjustmentDirection::as_str`]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "increase" => Some(AdjustmentDirection::Increase),
            "decrease" => Some(AdjustmentDirection::Decrease),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            AdjustmentDirection::Increase => AdjustmentDirection::Decrease,
            AdjustmentDirection::Decrease => AdjustmentDirection::Increase,
        }
    }
}

/// Outcome of a committed transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer_id: Uuid,
    pub from_tx: Transaction,
    pub to_tx: Transaction,
    pub from_balance: Decimal,
    pub to_balance: Decimal,
}

/// Time-boxed hold on spendable credits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditReservation {
    pub id: Uuid,
    pub user_id: UserId,
    pub amount: Decimal,
    pub purpose: String,
    pub reference_id: String,
    pub expires_at: DateTime<Utc>,
    pub is_released: bool,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl CreditReservation {
    /// Counts against spendable balance
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_released && self.expires_at > now
    }
}

/// Default page size for history queries
pub const DEFAULT_HISTORY_LIMIT: i64 = 20;

/// Largest page a single history query may return
pub const MAX_HISTORY_LIMIT: i64 = 100;

/// Transaction history filter
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub user_id: UserId,
    pub tx_type: Option<TransactionType>,
    pub status: Option<TransactionStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl HistoryQuery {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            tx_type: None,
            status: None,
            from: None,
            to: None,
            limit: DEFAULT_HISTORY_LIMIT,
            offset: 0,
        }
    }

    pub fn tx_type(mut self, tx_type: TransactionType) -> Self {
        self.tx_type = Some(tx_type);
        self
    }

    pub fn status(mut self, status: TransactionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn page(mut self, limit: i64, offset: i64) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Clamp paging into the supported range
    pub fn normalized(mut self) -> Self {
        self.limit = self.limit.clamp(1, MAX_HISTORY_LIMIT);
        self.offset = self.offset.max(0);
        self
    }

    /// In-memory form of the SQL filter. Date range is `[from, to)`.
    pub fn matches(&self, tx: &Transaction) -> bool {
        tx.user_id == self.user_id
            && self.tx_type.is_none_or(|t| t == tx.tx_type)
            && self.status.is_none_or(|s| s == tx.status)
            && self.from.is_none_or(|from| tx.created_at >= from)
            && self.to.is_none_or(|to| tx.created_at < to)
    }
}

/// One page of transaction history, newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionPage {
    pub transactions: Vec<Transaction>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}
