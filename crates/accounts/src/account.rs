use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eventline_core::{DomainError, DomainResult, EventId, State, StateKey};
use eventline_events::{Event, Guards};

/// State: one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    number: StateKey,
    balance: i64,
    open: bool,
    flagged_deposits: u32,
}

impl Account {
    pub fn number(&self) -> &StateKey {
        &self.number
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn flagged_deposits(&self) -> u32 {
        self.flagged_deposits
    }

    /// Net effect of `kind` on this account's balance.
    fn balance_delta(&self, kind: &AccountEventKind) -> i64 {
        match kind {
            AccountEventKind::Deposited { amount, .. } => *amount,
            AccountEventKind::Withdrawn { amount, .. } => -amount,
            AccountEventKind::Transferred { from, to, amount } => {
                let mut delta = 0;
                if *from == self.number {
                    delta -= amount;
                }
                if *to == self.number {
                    delta += amount;
                }
                delta
            }
            AccountEventKind::Opened { .. } | AccountEventKind::LargeDepositFlagged { .. } => 0,
        }
    }

    /// Deterministic state transition.
    pub(crate) fn apply(&mut self, kind: &AccountEventKind) {
        self.balance += self.balance_delta(kind);
        match kind {
            AccountEventKind::Opened { .. } => self.open = true,
            AccountEventKind::LargeDepositFlagged { .. } => self.flagged_deposits += 1,
            _ => {}
        }
    }
}

impl State for Account {
    fn initial(key: &StateKey) -> Self {
        Self {
            number: key.clone(),
            balance: 0,
            open: false,
            flagged_deposits: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccountEventKind {
    Opened { account: StateKey },
    Deposited { account: StateKey, amount: i64 },
    Withdrawn { account: StateKey, amount: i64 },
    Transferred { from: StateKey, to: StateKey, amount: i64 },
    LargeDepositFlagged { account: StateKey, amount: i64 },
}

/// Event: something that happened to one or two accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEvent {
    pub id: EventId,
    pub occurred_at: DateTime<Utc>,
    pub kind: AccountEventKind,
    /// Commit as soon as this event is fired.
    #[serde(default)]
    pub urgent: bool,
}

impl AccountEvent {
    pub fn new(kind: AccountEventKind) -> Self {
        Self {
            id: EventId::new(),
            occurred_at: Utc::now(),
            kind,
            urgent: false,
        }
    }

    pub fn opened(account: impl Into<StateKey>) -> Self {
        Self::new(AccountEventKind::Opened {
            account: account.into(),
        })
    }

    pub fn deposited(account: impl Into<StateKey>, amount: i64) -> Self {
        Self::new(AccountEventKind::Deposited {
            account: account.into(),
            amount,
        })
    }

    pub fn withdrawn(account: impl Into<StateKey>, amount: i64) -> Self {
        Self::new(AccountEventKind::Withdrawn {
            account: account.into(),
            amount,
        })
    }

    pub fn transferred(from: impl Into<StateKey>, to: impl Into<StateKey>, amount: i64) -> Self {
        Self::new(AccountEventKind::Transferred {
            from: from.into(),
            to: to.into(),
            amount,
        })
    }

    pub fn large_deposit_flagged(account: impl Into<StateKey>, amount: i64) -> Self {
        Self::new(AccountEventKind::LargeDepositFlagged {
            account: account.into(),
            amount,
        })
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    fn amount(&self) -> Option<i64> {
        match &self.kind {
            AccountEventKind::Opened { .. } => None,
            AccountEventKind::Deposited { amount, .. }
            | AccountEventKind::Withdrawn { amount, .. }
            | AccountEventKind::Transferred { amount, .. }
            | AccountEventKind::LargeDepositFlagged { amount, .. } => Some(*amount),
        }
    }
}

impl Event for AccountEvent {
    type State = Account;

    fn event_id(&self) -> EventId {
        self.id
    }

    fn event_type(&self) -> &'static str {
        match self.kind {
            AccountEventKind::Opened { .. } => "accounts.opened",
            AccountEventKind::Deposited { .. } => "accounts.deposited",
            AccountEventKind::Withdrawn { .. } => "accounts.withdrawn",
            AccountEventKind::Transferred { .. } => "accounts.transferred",
            AccountEventKind::LargeDepositFlagged { .. } => "accounts.large_deposit_flagged",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    fn states(&self) -> Vec<StateKey> {
        match &self.kind {
            AccountEventKind::Opened { account }
            | AccountEventKind::Deposited { account, .. }
            | AccountEventKind::Withdrawn { account, .. }
            | AccountEventKind::LargeDepositFlagged { account, .. } => vec![account.clone()],
            AccountEventKind::Transferred { from, to, .. } => vec![from.clone(), to.clone()],
        }
    }

    fn commits_immediately(&self) -> bool {
        self.urgent
    }

    fn validate(&self, state: Option<&Account>) -> DomainResult<()> {
        if self.amount().is_some_and(|amount| amount <= 0) {
            return Err(DomainError::validation("amount must be positive"));
        }

        match (&self.kind, state) {
            (AccountEventKind::Opened { .. }, Some(account)) if account.is_open() => Err(
                DomainError::conflict(format!("account {} is already open", account.number())),
            ),
            _ => Ok(()),
        }
    }
}

/// Registered guards of the accounts domain.
///
/// - `account_open`: every account touched by a movement must have been opened
/// - `sufficient_funds`: withdrawals and outgoing transfers cannot overdraw
/// - `distinct_accounts`: a transfer needs two different accounts
pub fn account_guards() -> Guards<AccountEvent> {
    Guards::new()
        .state_rule("account_open", |event: &AccountEvent, account: &Account| {
            match event.kind {
                AccountEventKind::Opened { .. } => Ok(()),
                _ if account.is_open() => Ok(()),
                _ => Err(DomainError::not_found(format!("account {}", account.number()))),
            }
        })
        .state_rule("sufficient_funds", |event: &AccountEvent, account: &Account| {
            let resulting = account.balance() + account.balance_delta(&event.kind);
            if resulting < 0 {
                return Err(DomainError::invariant(format!(
                    "insufficient funds in {} (balance {}, would be {resulting})",
                    account.number(),
                    account.balance()
                )));
            }
            Ok(())
        })
        .global_rule("distinct_accounts", |event: &AccountEvent| match &event.kind {
            AccountEventKind::Transferred { from, to, .. } if from == to => Err(
                DomainError::validation("cannot transfer to the same account"),
            ),
            _ => Ok(()),
        })
}
