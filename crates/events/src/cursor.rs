/// Convert a client's last-seen event id into the index to replay from.
///
/// The id is the sequence index of the last event the client received, so
/// replay starts one past it. Absent, malformed or negative ids all mean
/// "start from zero"; they are never an error.
pub fn parse_resume_cursor(last_event_id: Option<&str>) -> u64 {
    last_event_id
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .and_then(|last| last.checked_add(1))
        .unwrap_or(0)
}
