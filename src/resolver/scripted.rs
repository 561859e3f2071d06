use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::connection::RawConnection;
use super::strategy::{ResolveFuture, Strategy, StrategyKind};
use crate::error::ResolutionError;

#[derive(Default)]
struct Script {
    queued: VecDeque<Result<Vec<RawConnection>, ResolutionError>>,
    fallback: Option<Result<Vec<RawConnection>, ResolutionError>>,
    delay: Option<Duration>,
    calls: u32,
}

/// In-memory strategy with scripted results, for tests and demos.
///
/// Queued results are returned first, then the fallback result forever.
/// Clones share the same script.
#[derive(Clone)]
pub struct ScriptedStrategy {
    kind: StrategyKind,
    script: Arc<Mutex<Script>>,
}

impl ScriptedStrategy {
    pub fn new(kind: StrategyKind) -> Self {
        Self {
            kind,
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    /// Result returned once the queue is drained.
    pub fn always(&self, result: Result<Vec<RawConnection>, ResolutionError>) -> &Self {
        self.script.lock().fallback = Some(result);
        self
    }

    pub fn push(&self, result: Result<Vec<RawConnection>, ResolutionError>) -> &Self {
        self.script.lock().queued.push_back(result);
        self
    }

    /// Delay every call, e.g. to exceed a timeout.
    pub fn set_delay(&self, delay: Option<Duration>) -> &Self {
        self.script.lock().delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.script.lock().calls
    }
}

impl Strategy for ScriptedStrategy {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn resolve<'a>(&'a self, _pid: u32, _process_name: &'a str) -> ResolveFuture<'a> {
        Box::pin(async move {
            let (result, delay) = {
                let mut script = self.script.lock();
                script.calls += 1;
                let result = script
                    .queued
                    .pop_front()
                    .or_else(|| script.fallback.clone())
                    .unwrap_or_else(|| Ok(Vec::new()));
                (result, script.delay)
            };

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }
}
