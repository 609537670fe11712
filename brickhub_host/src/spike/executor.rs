//! Low-latency action execution by pre-uploading programs to slots.
//!
//! A cold action costs a full upload round (clear, start, chunks) before
//! the flow start, several hundred milliseconds on BLE. Pre-uploaded
//! actions cost one program-flow message. Uploads are skipped when the
//! slot already holds a program with the same CRC.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use brickhub_common::error::HubError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::crc;
use super::programs::{self, SequenceAction};
use super::session::SlotSession;

/// Slot for one-off and batched sequence programs.
pub const SCRATCH_SLOT: u8 = 18;
/// Slot for interactive sequences, kept apart so a cold action cannot
/// clobber a running interactive program.
pub const INTERACTIVE_SLOT: u8 = 17;

const SIGNAL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FastExecutor {
    session: SlotSession,
    slots: parking_lot::Mutex<HashMap<String, u8>>,
    slot_crcs: parking_lot::Mutex<HashMap<u8, u32>>,
}

impl FastExecutor {
    pub fn new(session: SlotSession) -> Self {
        Self {
            session,
            slots: parking_lot::Mutex::new(HashMap::new()),
            slot_crcs: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> &SlotSession {
        &self.session
    }

    /// Action names currently resolvable without an upload.
    pub fn available_actions(&self) -> Vec<String> {
        self.slots.lock().keys().cloned().collect()
    }

    /// Upload every builtin action to its slot. Failures are logged and
    /// skipped so one bad slot does not lose the rest. Returns the number
    /// of actions ready afterwards.
    pub async fn preload(&self) -> usize {
        let builtins = programs::builtin_actions();
        let started = Instant::now();
        for (i, (name, program)) in builtins.iter().enumerate() {
            let slot = i as u8;
            match self.upload_cached(slot, program).await {
                Ok(()) => {
                    self.slots.lock().insert((*name).to_string(), slot);
                }
                Err(e) => warn!(slot, action = name, error = %e, "preload failed"),
            }
        }
        let ready = self.slots.lock().len();
        info!(
            ready,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "preload complete"
        );
        ready
    }

    /// Upload unless the slot already holds this exact program.
    async fn upload_cached(&self, slot: u8, program: &[u8]) -> Result<(), HubError> {
        let checksum = crc::crc(program, 0);
        if self.slot_crcs.lock().get(&slot) == Some(&checksum) {
            debug!(slot, "slot already holds program");
            return Ok(());
        }
        self.session.upload_program(slot, "program.py", program).await?;
        self.slot_crcs.lock().insert(slot, checksum);
        Ok(())
    }

    fn resolve_cold(action: &str) -> Result<Vec<u8>, HubError> {
        let unknown = || HubError::UnknownAction(action.to_string());
        let mut parts = action.split_whitespace();
        let name = parts.next().ok_or_else(unknown)?;
        let args: Vec<&str> = parts.collect();

        // Routed commands can carry argument tails: "beep 880 200",
        // "display heart", "melody sad".
        match (name, args.as_slice()) {
            ("beep", [freq]) => {
                return Ok(programs::beep(freq.parse().map_err(|_| unknown())?, 300));
            }
            ("beep", [freq, dur]) => {
                return Ok(programs::beep(
                    freq.parse().map_err(|_| unknown())?,
                    dur.parse().map_err(|_| unknown())?,
                ));
            }
            ("display", [what]) => return Ok(programs::display(what)),
            ("melody", [which]) => {
                return programs::melody(which)
                    .map(programs::melody_program)
                    .ok_or_else(unknown);
            }
            _ => {}
        }
        if !args.is_empty() {
            return Err(unknown());
        }
        if let Some((_, program)) = programs::builtin_actions()
            .into_iter()
            .find(|(builtin, _)| *builtin == name)
        {
            return Ok(program);
        }
        // beep_<freq> synthesizes an ad-hoc beep.
        if let Some(freq) = name
            .strip_prefix("beep_")
            .and_then(|s| s.parse::<u16>().ok())
        {
            return Ok(programs::beep(freq, 300));
        }
        Err(unknown())
    }

    /// Run one action, preferring its pre-uploaded slot. Returns the
    /// host-side latency in milliseconds. `wait_for_ack` trades latency
    /// for confirmation on the warm path.
    pub async fn fast_action(&self, action: &str, wait_for_ack: bool) -> Result<f64, HubError> {
        let started = Instant::now();
        let slot = self.slots.lock().get(action).copied();
        match slot {
            Some(slot) => {
                if wait_for_ack {
                    self.session.start_program(slot).await?;
                } else {
                    self.session.start_program_nowait(slot).await?;
                }
            }
            None => {
                let program = Self::resolve_cold(action)?;
                debug!(action, "cold action, uploading to scratch slot");
                self.upload_cached(SCRATCH_SLOT, &program).await?;
                self.session.start_program_nowait(SCRATCH_SLOT).await?;
            }
        }
        Ok(elapsed_ms(started))
    }

    /// Run a whole sequence as one generated program: one upload, one
    /// flow start, one startup melody.
    pub async fn run_sequence(
        &self,
        actions: &[SequenceAction],
        gap_ms: u32,
    ) -> Result<f64, HubError> {
        let program = programs::sequence(actions, gap_ms);
        let started = Instant::now();
        self.upload_cached(SCRATCH_SLOT, &program).await?;
        self.session.start_program_nowait(SCRATCH_SLOT).await?;
        Ok(elapsed_ms(started))
    }

    /// Run a sequence whose steps signal completion over the console
    /// channel, awaiting `on_action_done` between steps. The callback
    /// receives the 1-based count of completed steps. A step that never
    /// signals within the timeout ends the wait without failing the
    /// whole sequence.
    pub async fn run_interactive_sequence<F, Fut>(
        &self,
        actions: &[SequenceAction],
        mut on_action_done: F,
    ) -> Result<f64, HubError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = ()>,
    {
        let program = programs::interactive_sequence(actions);
        let (tx, mut rx) = mpsc::channel::<usize>(32);
        self.session.set_console_callback(move |text| {
            let Some(rest) = text.split("DONE:").nth(1) else {
                return;
            };
            if let Ok(index) = rest.trim().parse::<usize>() {
                // Drop signals beyond the buffer rather than block the
                // notification path.
                let _ = tx.try_send(index);
            }
        });

        let started = Instant::now();
        let result = async {
            self.upload_cached(INTERACTIVE_SLOT, &program).await?;
            self.session.start_program_nowait(INTERACTIVE_SLOT).await?;

            let mut completed = 0usize;
            for step in 0..actions.len() {
                match tokio::time::timeout(SIGNAL_TIMEOUT, rx.recv()).await {
                    Ok(Some(index)) => {
                        completed += 1;
                        debug!(index, completed, "step signalled");
                        on_action_done(completed).await;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!(step, "no completion signal, abandoning wait");
                        break;
                    }
                }
            }
            Ok(())
        }
        .await;
        self.session.clear_console_callback();
        result.map(|()| elapsed_ms(started))
    }

    /// Best-effort teardown of the underlying session.
    pub async fn shutdown(&self) {
        self.session.disconnect().await;
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
