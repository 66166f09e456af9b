use uuid::Uuid;

/// A non-blank client id is used verbatim; otherwise a fresh UUID v4.
pub fn resolve_session_id(client_session_id: Option<&str>) -> String {
    client_session_id
        .filter(|session_id| !session_id.trim().is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Session bookkeeping for one WebSocket connection.
///
/// The first message without a session id fixes a generated id that every
/// later id-less message on the same connection reuses.
#[derive(Debug, Default)]
pub(super) struct ConnectionSession {
    generated: Option<String>,
}

impl ConnectionSession {
    pub(super) fn resolve(&mut self, client_session_id: Option<&str>) -> String {
        if let Some(session_id) =
            client_session_id.filter(|session_id| !session_id.trim().is_empty())
        {
            return session_id.to_string();
        }

        self.generated
            .get_or_insert_with(|| resolve_session_id(None))
            .clone()
    }
}
