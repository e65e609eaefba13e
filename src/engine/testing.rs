//! In-process doubles for unit tests: a recording driver and a fake tunnel opener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::params::Params;
use crate::engine::pool::PoolSettings;
use crate::engine::ssh_tunnel::{PortForward, TunnelOpener};
use crate::engine::traits::DataEngine;
use crate::engine::types::{
    ColumnInfo, ConnectionConfig, Dialect, PoolStatus, QueryResult, Row, SessionId, SshTunnelConfig,
    Value,
};

/// Driver that records every call and keeps per-session transaction state
pub struct MockEngine {
    dialect: Dialect,
    calls: Mutex<Vec<String>>,
    sessions: Mutex<HashMap<SessionId, bool>>,
    endpoints: Mutex<Vec<(String, u16)>>,
    fail_connect: AtomicBool,
    fail_ping: AtomicBool,
    fail_on: Mutex<Option<String>>,
    responses: Mutex<Vec<(String, QueryResult)>>,
    delay: Duration,
}

impl MockEngine {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            calls: Mutex::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
            endpoints: Mutex::new(Vec::new()),
            fail_connect: AtomicBool::new(false),
            fail_ping: AtomicBool::new(false),
            fail_on: Mutex::new(None),
            responses: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// `test_connection` and `connect` wait `delay` before answering
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    pub fn failing_connect(self) -> Self {
        self.fail_connect.store(true, Ordering::SeqCst);
        self
    }

    /// Statements containing `marker` fail with an execution error
    pub fn fail_statements_containing(&self, marker: &str) {
        *self.fail_on.lock().unwrap() = Some(marker.to_string());
    }

    /// Statements containing `marker` answer with `result`
    pub fn respond_to(&self, marker: &str, result: QueryResult) {
        self.responses.lock().unwrap().push((marker.to_string(), result));
    }

    pub fn set_ping_failure(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Host/port pairs passed to `connect`
    pub fn endpoints(&self) -> Vec<(String, u16)> {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn in_transaction(&self, session: SessionId) -> EngineResult<bool> {
        self.sessions
            .lock()
            .unwrap()
            .get(&session)
            .copied()
            .ok_or_else(|| EngineError::session_not_found(session.to_string()))
    }

    fn set_transaction(&self, session: SessionId, active: bool) {
        if let Some(state) = self.sessions.lock().unwrap().get_mut(&session) {
            *state = active;
        }
    }
}

#[async_trait]
impl DataEngine for MockEngine {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn driver_name(&self) -> &'static str {
        "Mock"
    }

    async fn test_connection(&self, config: &ConnectionConfig) -> EngineResult<()> {
        self.record(format!("test {}:{}", config.host(), config.port()));
        self.pause().await;
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(EngineError::connection_failed("mock refused"));
        }
        Ok(())
    }

    async fn connect(&self, config: &ConnectionConfig, _pool: &PoolSettings) -> EngineResult<SessionId> {
        self.record(format!("connect {}:{}", config.host(), config.port()));
        self.endpoints
            .lock()
            .unwrap()
            .push((config.host().to_string(), config.port()));
        self.pause().await;
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(EngineError::connection_failed("mock refused"));
        }
        let session = SessionId::new();
        self.sessions.lock().unwrap().insert(session, false);
        Ok(session)
    }

    async fn disconnect(&self, session: SessionId) -> EngineResult<()> {
        self.record("disconnect");
        self.sessions
            .lock()
            .unwrap()
            .remove(&session)
            .map(|_| ())
            .ok_or_else(|| EngineError::session_not_found(session.to_string()))
    }

    async fn ping(&self, session: SessionId) -> EngineResult<()> {
        self.in_transaction(session)?;
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(EngineError::connection_failed("mock ping failed"));
        }
        Ok(())
    }

    async fn execute(&self, session: SessionId, sql: &str, params: &Params) -> EngineResult<QueryResult> {
        self.in_transaction(session)?;
        self.record(format!("execute {}", sql));

        if let Some(marker) = self.fail_on.lock().unwrap().as_deref() {
            if sql.contains(marker) {
                return Err(EngineError::execution_error(format!("mock failure on {}", marker)));
            }
        }

        let canned = self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(marker, _)| sql.contains(marker.as_str()))
            .map(|(_, result)| result.clone());
        if let Some(result) = canned {
            return Ok(result);
        }

        if sql.trim_start().to_ascii_uppercase().starts_with("SELECT") {
            let mut columns = vec![ColumnInfo {
                name: "sql".to_string(),
                data_type: "TEXT".to_string(),
                nullable: false,
            }];
            let mut values = vec![Value::Text(sql.to_string())];
            for (name, value) in params.iter() {
                columns.push(ColumnInfo {
                    name: name.to_string(),
                    data_type: "TEXT".to_string(),
                    nullable: true,
                });
                values.push(value.clone());
            }
            return Ok(QueryResult::with_rows(columns, vec![Row { values }], 0.0));
        }

        Ok(QueryResult::with_affected_rows(1, 0.0))
    }

    async fn begin_transaction(&self, session: SessionId) -> EngineResult<()> {
        if self.in_transaction(session)? {
            return Err(EngineError::transaction_error(
                "A transaction is already active on this session",
            ));
        }
        self.record("begin");
        self.set_transaction(session, true);
        Ok(())
    }

    async fn commit(&self, session: SessionId) -> EngineResult<()> {
        if !self.in_transaction(session)? {
            return Err(EngineError::transaction_error("No active transaction to commit"));
        }
        self.record("commit");
        self.set_transaction(session, false);
        Ok(())
    }

    async fn rollback(&self, session: SessionId) -> EngineResult<()> {
        if !self.in_transaction(session)? {
            return Err(EngineError::transaction_error("No active transaction to rollback"));
        }
        self.record("rollback");
        self.set_transaction(session, false);
        Ok(())
    }

    async fn pool_status(&self, session: SessionId) -> EngineResult<PoolStatus> {
        let in_transaction = self.in_transaction(session)?;
        Ok(PoolStatus {
            size: 1,
            idle: if in_transaction { 0 } else { 1 },
            in_transaction,
        })
    }
}

struct FakeForward {
    local_port: u16,
    alive: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl PortForward for FakeForward {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn is_running(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> EngineResult<()> {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Tunnel opener that hands out fake forwards on increasing ports
pub struct FakeOpener {
    fail: bool,
    next_port: AtomicU16,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
    alive: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeOpener {
    pub fn new() -> Self {
        Self {
            fail: false,
            next_port: AtomicU16::new(40000),
            opened: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            alive: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulates every ssh process dying
    pub fn kill_all(&self) {
        for alive in self.alive.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl TunnelOpener for FakeOpener {
    async fn open(
        &self,
        _config: &SshTunnelConfig,
        _remote_host: &str,
        _remote_port: u16,
        _ready_timeout: Duration,
    ) -> EngineResult<Box<dyn PortForward>> {
        if self.fail {
            return Err(EngineError::ssh_error("ssh exited with status 255"));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        self.alive.lock().unwrap().push(alive.clone());
        Ok(Box::new(FakeForward {
            local_port: self.next_port.fetch_add(1, Ordering::SeqCst),
            alive,
            closed: self.closed.clone(),
        }))
    }
}
