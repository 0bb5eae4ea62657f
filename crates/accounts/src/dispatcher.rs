use serde_json::{Value as JsonValue, json};

use eventline_core::StateHandle;
use eventline_events::{Dispatcher, Followups};

use crate::account::{Account, AccountEvent, AccountEventKind};

/// Deposits at or above this amount are flagged unless configured otherwise.
pub const DEFAULT_LARGE_DEPOSIT_THRESHOLD: i64 = 10_000;

/// Routes account events to the account state and its post-commit handling.
///
/// Handling a deposit at or above the threshold fires a `LargeDepositFlagged`
/// follow-up for the same account. Each handled state yields one result with its
/// committed balance.
#[derive(Debug, Clone)]
pub struct AccountDispatcher {
    large_deposit_threshold: i64,
}

impl AccountDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_large_deposit_threshold(mut self, threshold: i64) -> Self {
        self.large_deposit_threshold = threshold;
        self
    }
}

impl Default for AccountDispatcher {
    fn default() -> Self {
        Self {
            large_deposit_threshold: DEFAULT_LARGE_DEPOSIT_THRESHOLD,
        }
    }
}

impl Dispatcher<AccountEvent> for AccountDispatcher {
    fn apply(&self, event: &AccountEvent, state: &mut Account) {
        state.apply(&event.kind);
    }

    fn handle(
        &self,
        event: &AccountEvent,
        states: &[StateHandle<Account>],
        followups: &mut Followups<AccountEvent>,
    ) -> Vec<JsonValue> {
        if let AccountEventKind::Deposited { account, amount } = &event.kind {
            if *amount >= self.large_deposit_threshold {
                followups.fire(AccountEvent::large_deposit_flagged(account.clone(), *amount));
            }
        }

        states
            .iter()
            .map(|cell| {
                cell.read(|account| {
                    json!({
                        "account": account.number(),
                        "balance": account.balance(),
                    })
                })
            })
            .collect()
    }
}
