use serde::{Deserialize, Serialize};

/// 播放器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Init,
    Prepared,
    Playing,
    Paused,
    Seeking,
    Stopped,
    Completed,
    Error,
}

impl PlayerState {
    /// 状态转换表，`Stopped` 为终态
    pub fn can_transition_to(self, next: PlayerState) -> bool {
        use PlayerState::*;
        match self {
            Init => matches!(next, Prepared | Stopped),
            Prepared => matches!(next, Playing | Paused | Stopped),
            Playing => matches!(next, Paused | Seeking | Completed | Error | Stopped | Init),
            Paused => matches!(next, Playing | Seeking | Error | Stopped | Init | Prepared),
            Seeking => matches!(next, Playing | Paused | Error | Stopped | Init),
            Completed => matches!(next, Playing | Prepared | Stopped | Init),
            Error => matches!(next, Init | Stopped),
            Stopped => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == PlayerState::Stopped
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlayerState::Init => "INIT",
            PlayerState::Prepared => "PREPARED",
            PlayerState::Playing => "PLAYING",
            PlayerState::Paused => "PAUSED",
            PlayerState::Seeking => "SEEKING",
            PlayerState::Stopped => "STOPPED",
            PlayerState::Completed => "COMPLETED",
            PlayerState::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::PlayerState::{self, *};

    const ALL: [PlayerState; 8] = [Init, Prepared, Playing, Paused, Seeking, Stopped, Completed, Error];

    #[test]
    fn stopped_is_terminal() {
        for next in ALL {
            assert!(!Stopped.can_transition_to(next), "STOPPED -> {next}");
        }
        assert!(Stopped.is_terminal());
    }

    #[test]
    fn every_live_state_can_stop() {
        for state in ALL.into_iter().filter(|s| *s != Stopped) {
            assert!(state.can_transition_to(Stopped), "{state} -> STOPPED");
        }
    }

    #[test]
    fn seek_only_from_playing_or_paused() {
        let from: Vec<_> = ALL.into_iter().filter(|s| s.can_transition_to(Seeking)).collect();
        assert_eq!(from, vec![Playing, Paused]);
    }

    #[test]
    fn prepare_routes() {
        assert!(Init.can_transition_to(Prepared));
        assert!(Paused.can_transition_to(Prepared));
        assert!(Completed.can_transition_to(Prepared));
        assert!(!Playing.can_transition_to(Prepared));
        assert!(Playing.can_transition_to(Init));
        assert!(!Error.can_transition_to(Playing));
    }
}
