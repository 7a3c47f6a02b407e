use std::{sync::Arc, time::Duration};

use super::{OutputFanout, SessionId, ShellSpec};
use crate::error::PtyError;

/// Hosts without pseudo terminals cannot open sessions, so this type has no values.
pub(super) enum Terminal {}

impl Terminal {
    pub(super) fn open(_id: SessionId, _spec: &ShellSpec, _output: Arc<OutputFanout>) -> Result<Self, PtyError> {
        Err(PtyError::Unsupported)
    }

    pub(super) fn pid(&self) -> u32 {
        match *self {}
    }

    pub(super) async fn write(&self, _bytes: &[u8]) -> Result<(), PtyError> {
        match *self {}
    }

    pub(super) async fn resize(&self, _cols: u16, _rows: u16) -> Result<(), PtyError> {
        match *self {}
    }

    pub(super) fn try_reap(&self) -> bool {
        match *self {}
    }

    pub(super) async fn close(&self, _grace: Duration) {
        match *self {}
    }
}
