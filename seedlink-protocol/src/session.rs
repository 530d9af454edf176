//! Per-connection protocol state, shared by client and server.
//!
//! The same [`Session`] validates commands on both ends: a server applies
//! each command it receives, a client applies each command before sending
//! it. `apply` reports what the command means for the connection; the
//! caller performs the I/O.

use crate::command::Command;
use crate::error::{Result, SeedlinkError};
use crate::version::ProtocolVersion;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Connected, nothing negotiated.
    Handshake,
    /// HELLO or SLPROTO seen; the version is fixed from here on.
    Negotiated,
    /// At least one selection command seen.
    Selecting,
    Streaming,
    Closing,
    Closed,
    Errored,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Negotiated => "negotiated",
            Self::Selecting => "selecting",
            Self::Streaming => "streaming",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed | Self::Errored)
    }

    fn before_streaming(self) -> bool {
        matches!(self, Self::Handshake | Self::Negotiated | Self::Selecting)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an accepted command asks the connection to do.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Reply (if the command has a reply) and keep going.
    Continue,
    /// The session switched to `version`; framing must follow.
    Negotiated(ProtocolVersion),
    /// Selection is complete. The caller validates it and then calls
    /// [`Session::commit`]. `fetch` requests dial-up delivery.
    Commit { fetch: bool },
    /// Graceful close requested.
    Close,
}

#[derive(Clone, Debug)]
pub struct Session {
    state: SessionState,
    version: ProtocolVersion,
    batch: bool,
    fetch: bool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Handshake,
            version: ProtocolVersion::V3,
            batch: false,
            fetch: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// BATCH mode: replies to selection commands are suppressed.
    pub fn batch(&self) -> bool {
        self.batch
    }

    /// Dial-up mode: deliver the catch-up only, then close.
    pub fn fetch(&self) -> bool {
        self.fetch
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }

    /// Validate `command` against the current state and advance.
    ///
    /// Errors before streaming leave the state unchanged so the peer can
    /// retry. An unexpected command while streaming moves the session to
    /// [`SessionState::Errored`].
    pub fn apply(&mut self, command: &Command) -> Result<Transition> {
        if self.state.is_terminal() {
            return Err(self.unexpected(command));
        }
        if self.state == SessionState::Streaming {
            return self.apply_streaming(command);
        }

        let supported = command.is_valid_for(self.version)
            || matches!(command, Command::SlProto { .. } | Command::UserAgent { .. });
        if !supported {
            return Err(SeedlinkError::InvalidCommand(format!(
                "{} is not a v{} command",
                command.name(),
                self.version
            )));
        }

        match command {
            Command::Hello => {
                if self.state == SessionState::Handshake {
                    self.state = SessionState::Negotiated;
                }
                Ok(Transition::Continue)
            }
            Command::SlProto { version } => {
                if self.state == SessionState::Selecting {
                    return Err(self.unexpected(command));
                }
                self.version = *version;
                self.state = SessionState::Negotiated;
                Ok(Transition::Negotiated(*version))
            }
            Command::Station { .. } | Command::Select { .. } | Command::Data { .. } | Command::Time { .. } => {
                self.state = SessionState::Selecting;
                Ok(Transition::Continue)
            }
            Command::Fetch { .. } => {
                self.fetch = true;
                self.state = SessionState::Selecting;
                Ok(Transition::Continue)
            }
            Command::Batch => {
                self.batch = true;
                Ok(Transition::Continue)
            }
            Command::Cat | Command::Info { .. } | Command::Auth { .. } | Command::UserAgent { .. } => {
                Ok(Transition::Continue)
            }
            Command::End => Ok(Transition::Commit { fetch: self.fetch }),
            Command::EndFetch => Ok(Transition::Commit { fetch: true }),
            Command::Bye => {
                self.state = SessionState::Closing;
                Ok(Transition::Close)
            }
        }
    }

    fn apply_streaming(&mut self, command: &Command) -> Result<Transition> {
        match command {
            Command::End | Command::EndFetch | Command::Bye => {
                self.state = SessionState::Closing;
                Ok(Transition::Close)
            }
            Command::Info { .. } if self.version == ProtocolVersion::V4 => Ok(Transition::Continue),
            _ => {
                let err = self.unexpected(command);
                self.state = SessionState::Errored;
                Err(err)
            }
        }
    }

    fn unexpected(&self, command: &Command) -> SeedlinkError {
        SeedlinkError::UnexpectedCommand {
            command: command.name(),
            state: self.state.as_str(),
        }
    }

    /// Enter streaming after a successful [`Transition::Commit`].
    pub fn commit(&mut self) -> Result<()> {
        if !self.state.before_streaming() {
            return Err(SeedlinkError::UnexpectedCommand {
                command: "END",
                state: self.state.as_str(),
            });
        }
        self.state = SessionState::Streaming;
        Ok(())
    }

    /// Record a fatal error.
    pub fn fail(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Errored;
        }
    }

    /// Begin a graceful close from the local side.
    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.state = SessionState::Closing;
        }
    }

    /// The transport is gone.
    pub fn finish(&mut self) {
        self.state = SessionState::Closed;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
