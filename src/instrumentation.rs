//! Application facing instrumentation: transactions, entity state and collections.
use std::{collections::HashMap, time::Duration};

use serde_json::json;

use crate::{
    event::{EventBody, EventKind},
    properties::merge,
    transaction::{TransactionHandle, TransactionKind, PURCHASE_CATEGORY, SESSION_CATEGORY},
    transaction_registry::NewTransaction,
    Error, Properties, PropertyValue, Purchase, Result, SessionController, TimeoutMode,
    TransactionState, TXN_SUCCESS,
};

/// Factory for transactions and reporter of entity state.
///
/// Obtained from [`SessionController::instrumentation`].
#[derive(Debug, Clone)]
pub struct Instrumentation {
    session: SessionController,
}

impl Instrumentation {
    pub(crate) fn new(session: SessionController) -> Instrumentation {
        Instrumentation { session }
    }

    /// A transaction in `category`. Nothing is reported until it is begun.
    pub fn transaction(&self, category: impl Into<String>) -> Transaction {
        Transaction::new(self.session.clone(), TransactionKind::Custom, category.into(), None)
    }

    /// A transaction in `category` distinguished from concurrent ones by `transaction_id`.
    pub fn transaction_with_id(
        &self,
        category: impl Into<String>,
        transaction_id: impl Into<String>,
    ) -> Transaction {
        Transaction::new(
            self.session.clone(),
            TransactionKind::Custom,
            category.into(),
            Some(transaction_id.into()),
        )
    }

    /// A transaction, letting `init` set properties before it is returned.
    ///
    /// ```no_run
    /// # fn f(instrumentation: &splyt::Instrumentation) -> splyt::Result<()> {
    /// instrumentation
    ///     .transaction_with_init("Level", Some("3"), |txn| {
    ///         txn.set_property("difficulty", "hard");
    ///     })
    ///     .begin()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn transaction_with_init(
        &self,
        category: impl Into<String>,
        transaction_id: Option<&str>,
        init: impl FnOnce(&mut Transaction),
    ) -> Transaction {
        let mut transaction = Transaction::new(
            self.session.clone(),
            TransactionKind::Custom,
            category.into(),
            transaction_id.map(str::to_owned),
        );
        init(&mut transaction);
        transaction
    }

    /// The session transaction. Its timeout mode is always [`TimeoutMode::Transaction`].
    pub fn session_transaction(&self) -> Transaction {
        Transaction::new(
            self.session.clone(),
            TransactionKind::Session,
            SESSION_CATEGORY.to_owned(),
            None,
        )
    }

    /// A purchase transaction. Attach details with [`Transaction::set_purchase`].
    pub fn purchase_transaction(&self, transaction_id: Option<&str>) -> Transaction {
        Transaction::new(
            self.session.clone(),
            TransactionKind::Purchase,
            PURCHASE_CATEGORY.to_owned(),
            transaction_id.map(str::to_owned),
        )
    }

    /// Report updated properties of the device.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`] if called before [`SessionController::init`].
    pub fn update_device_state(&self, properties: Properties) -> Result<()> {
        self.session.with_core(|core, _| {
            core.require_initialized()?;
            core.record(EventBody::new(
                EventKind::DeviceState,
                HashMap::from([("properties".to_owned(), json!(properties))]),
            ));
            Ok(())
        })
    }

    /// Report updated properties of the active user.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`] if called before [`SessionController::init`].
    /// - [`Error::MissingId`] if there is no active user.
    pub fn update_user_state(&self, properties: Properties) -> Result<()> {
        self.session.with_core(|core, _| {
            core.require_initialized()?;
            if core.active_user().is_none() {
                return Err(Error::MissingId);
            }
            core.record(EventBody::new(
                EventKind::UserState,
                HashMap::from([("properties".to_owned(), json!(properties))]),
            ));
            Ok(())
        })
    }

    /// Report the balance of a collection, such as a virtual currency or an inventory, after a
    /// change of `modification`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`] if called before [`SessionController::init`].
    /// - [`Error::InvalidArgs`] if `name` is empty.
    pub fn update_collection(
        &self,
        name: &str,
        balance: f64,
        modification: f64,
        is_currency: bool,
    ) -> Result<()> {
        self.session.with_core(|core, _| {
            core.require_initialized()?;
            if name.is_empty() {
                return Err(Error::InvalidArgs("collection name must not be empty"));
            }
            core.record(EventBody::new(
                EventKind::CollectionUpdate,
                HashMap::from([
                    ("name".to_owned(), json!(name)),
                    ("balance".to_owned(), json!(balance)),
                    ("balanceModification".to_owned(), json!(modification)),
                    ("isCurrency".to_owned(), json!(is_currency)),
                ]),
            ));
            Ok(())
        })
    }
}

/// An application transaction: something with a beginning and an end, like a level, a tutorial
/// step or a purchase.
///
/// Properties set before [`Transaction::begin`] are reported with the begin event. Later ones
/// accumulate and are reported with the end event. Calls on an ended or timed out transaction
/// have no effect and return its terminal state.
#[derive(Debug)]
pub struct Transaction {
    session: SessionController,
    kind: TransactionKind,
    category: String,
    transaction_id: Option<String>,
    pending: Properties,
    handle: Option<TransactionHandle>,
}

impl Transaction {
    fn new(
        session: SessionController,
        kind: TransactionKind,
        category: String,
        transaction_id: Option<String>,
    ) -> Transaction {
        Transaction {
            session,
            kind,
            category,
            transaction_id,
            pending: Properties::new(),
            handle: None,
        }
    }

    /// What the transaction represents.
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Category the transaction reports.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Id distinguishing concurrent transactions of the same category.
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// Set a single property.
    pub fn set_property(
        &mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> &mut Self {
        self.set_properties(Properties::from([(key.into(), value.into())]))
    }

    /// Set multiple properties. Later keys override earlier ones.
    pub fn set_properties(&mut self, properties: Properties) -> &mut Self {
        match self.handle {
            Some(handle) => {
                self.session.with_core(|core, now| {
                    core.registry.set_properties(handle, properties, now);
                });
            }
            None => merge(&mut self.pending, properties),
        }
        self
    }

    /// Attach purchase details.
    pub fn set_purchase(&mut self, purchase: &Purchase) -> &mut Self {
        self.set_properties(purchase.properties())
    }

    /// Begin the transaction with the default timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`] if called before [`SessionController::init`].
    /// - [`Error::InvalidArgs`] if the transaction was already begun or its category is empty.
    pub fn begin(&mut self) -> Result<()> {
        self.begin_with_timeout_and_mode(Duration::ZERO, TimeoutMode::default())
    }

    /// Begin the transaction. It times out unless updated within `timeout`. Zero selects the
    /// default timeout.
    ///
    /// # Errors
    ///
    /// See [`Transaction::begin`].
    pub fn begin_with_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.begin_with_timeout_and_mode(timeout, TimeoutMode::default())
    }

    /// Begin the transaction with an explicit timeout mode.
    ///
    /// # Errors
    ///
    /// See [`Transaction::begin`]. Additionally [`Error::InvalidArgs`] if a session transaction
    /// asks for [`TimeoutMode::Any`].
    pub fn begin_with_timeout_and_mode(&mut self, timeout: Duration, mode: TimeoutMode) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::InvalidArgs("transaction was already begun"));
        }
        if self.kind == TransactionKind::Session && mode == TimeoutMode::Any {
            return Err(Error::InvalidArgs("session transactions only support timeout mode Transaction"));
        }

        let txn = self.new_transaction().timeout(timeout).mode(mode);
        let handle = self.session.with_core(|core, now| {
            core.require_initialized()?;
            core.registry.begin(txn, now)
        })?;
        self.pending.clear();
        self.handle = Some(handle);
        Ok(())
    }

    /// Report progress and reset the timeout.
    ///
    /// Returns the state of the transaction, or `None` if it was never begun.
    pub fn update_at_progress(&mut self, progress: i64) -> Option<TransactionState> {
        let handle = self.handle?;
        self.session
            .with_core(|core, now| core.registry.update_at_progress(handle, progress, now))
    }

    /// End the transaction with [`TXN_SUCCESS`].
    ///
    /// Returns the state of the transaction, or `None` if it was never begun.
    pub fn end(&mut self) -> Option<TransactionState> {
        self.end_with_result(TXN_SUCCESS)
    }

    /// End the transaction with `result`.
    pub fn end_with_result(&mut self, result: &str) -> Option<TransactionState> {
        let handle = self.handle?;
        self.session
            .with_core(|core, now| core.registry.end(handle, result, now))
    }

    /// Report the transaction as instantaneous, ending with [`TXN_SUCCESS`].
    ///
    /// # Errors
    ///
    /// See [`Transaction::begin`].
    pub fn begin_and_end(&mut self) -> Result<()> {
        self.begin_and_end_with_result(TXN_SUCCESS)
    }

    /// Report the transaction as instantaneous, ending with `result`.
    pub fn begin_and_end_with_result(&mut self, result: &str) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::InvalidArgs("transaction was already begun"));
        }
        let txn = self.new_transaction();
        self.session.with_core(|core, now| {
            core.require_initialized()?;
            core.registry.begin_and_end(txn, Some(result), now)
        })?;
        self.pending.clear();
        Ok(())
    }

    /// Current state, or `None` if the transaction was never begun.
    pub fn state(&self) -> Option<TransactionState> {
        let handle = self.handle?;
        self.session.with_core(|core, _| core.registry.state(handle))
    }

    fn new_transaction(&self) -> NewTransaction {
        let txn = NewTransaction::new(self.category.clone()).properties(self.pending.clone());
        match &self.transaction_id {
            Some(transaction_id) => txn.transaction_id(transaction_id.clone()),
            None => txn,
        }
    }
}
