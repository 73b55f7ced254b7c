//! Wallet-to-wallet transfers.

use super::{
    engine::BalanceEngine,
    errors::{WalletError, WalletResult},
    models::{Transaction, TransactionType, TransferResult, UserId, validate_amount},
    store::{AtomicScope, LedgerUnit},
};
use rust_decimal::Decimal;
use tracing::Span;
use uuid::Uuid;

/// `source` recorded on both transfer legs
pub const TRANSFER_SOURCE: &str = "transfer";

/// Moves credits between two wallets in a single atomic unit
#[derive(Clone)]
pub struct TransferCoordinator {
    engine: BalanceEngine,
    span: Span,
}

impl TransferCoordinator {
    pub fn new(engine: BalanceEngine, span: Span) -> Self {
        Self { engine, span }
    }

    /// Debit `from_user`, credit `to_user`. Both legs share one transfer ID,
    /// which is also their reference ID. The receiver's wallet is created if
    /// needed.
    pub async fn transfer_credits(
        &self,
        from_user: UserId,
        to_user: UserId,
        amount: Decimal,
        description: &str,
    ) -> WalletResult<TransferResult> {
        const OP: &str = "transfer";
        if from_user == to_user {
            return Err(self.engine.rejected(OP, WalletError::SameUserTransfer));
        }
        let amount = validate_amount(amount).map_err(|e| self.engine.rejected(OP, e))?;

        let transfer_id = Uuid::new_v4();
        let reference_id = transfer_id.to_string();
        // Ascending user ID lock order comes from the scope
        let scope = AtomicScope::user(from_user).with_user(to_user);

        let committed = self
            .engine
            .run_unit(OP, &scope, &|unit: &mut LedgerUnit| {
                let from_balance = unit.debit(from_user, amount)?;
                let to_balance = unit.credit(to_user, amount)?;
                let now = unit.now();

                let mut out_leg =
                    Transaction::completed(from_user, TransactionType::TransferOut, amount, from_balance, now);
                let mut in_leg =
                    Transaction::completed(to_user, TransactionType::TransferIn, amount, to_balance, now);
                for leg in [&mut out_leg, &mut in_leg] {
                    leg.source = TRANSFER_SOURCE.to_string();
                    leg.description = description.to_string();
                    leg.reference_id = reference_id.clone();
                    leg.from_user_id = Some(from_user);
                    leg.to_user_id = Some(to_user);
                }

                unit.record(out_leg);
                unit.record(in_leg);
                Ok(())
            })
            .await?;

        let mut legs = committed.transactions.into_iter();
        let (Some(from_tx), Some(to_tx)) = (legs.next(), legs.next()) else {
            return Err(WalletError::Storage(format!(
                "transfer {transfer_id} committed without both legs"
            )));
        };

        let result = TransferResult {
            transfer_id,
            from_balance: from_tx.balance_after,
            to_balance: to_tx.balance_after,
            from_tx,
            to_tx,
        };

        tracing::info!(
            parent: &self.span,
            transfer_id = %transfer_id,
            from_user = %from_user,
            to_user = %to_user,
            amount = %amount,
            "Transfer committed"
        );

        let notifier = self.engine.notifier();
        notifier.transfer_completed(&result);
        notifier.balance_updated(&result.from_tx);
        notifier.balance_updated(&result.to_tx);

        Ok(result)
    }
}
