/// Where the server is in its request/resume cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Dispatching,
    Resuming,
    Stopped,
    Detached,
}

impl ServerState {
    fn allows(self, next: ServerState) -> bool {
        use ServerState::*;

        matches!(
            (self, next),
            (Idle, Dispatching)
                | (Dispatching, Dispatching)
                | (Dispatching, Resuming)
                | (Dispatching, Stopped)
                | (Resuming, Stopped)
                | (Stopped, Dispatching)
                | (_, Detached)
        )
    }

    pub(crate) fn transition(&mut self, next: ServerState) {
        if *self == ServerState::Detached {
            tracing::warn!(?next, "ignoring transition out of detached state");
            return;
        }
        if self.allows(next) {
            tracing::trace!(from = ?*self, to = ?next, "server state transition");
        } else {
            tracing::warn!(from = ?*self, to = ?next, "unexpected server state transition");
        }
        *self = next;
    }
}

/// Which requests are meaningful right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportState {
    Normal,
    /// The recording is exhausted and every debuggee thread is gone
    ThreadsDead,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_cycle() {
        let mut state = ServerState::Idle;
        for next in [
            ServerState::Dispatching,
            ServerState::Resuming,
            ServerState::Stopped,
            ServerState::Dispatching,
        ] {
            assert!(state.allows(next));
            state.transition(next);
        }
        state.transition(ServerState::Detached);
        state.transition(ServerState::Dispatching);
        assert_eq!(state, ServerState::Detached);
    }
}
