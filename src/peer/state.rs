use serde::{Deserialize, Serialize};

/// Состояние сессии с удалённым участником
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    /// `Failed` и `Closed` конечны: восстановление идёт через новую сессию
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }

    /// Удалённое описание уже применено
    pub fn has_remote_description(self) -> bool {
        matches!(
            self,
            SessionState::OfferReceived
                | SessionState::AnswerSent
                | SessionState::AnswerReceived
                | SessionState::Connected
        )
    }

    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        match next {
            Failed | Closed => true,
            OfferSent => self == Created,
            OfferReceived => matches!(self, Created | AnswerReceived),
            AnswerSent => self == OfferReceived,
            AnswerReceived => self == OfferSent,
            Connected => matches!(self, AnswerReceived | AnswerSent),
            Created => false,
        }
    }
}

/// Состояние транспорта, как его сообщает нижний уровень
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}
