//! Query surface: thin projections over the stores with uniform options.
//!
//! `replay` merges per-agent event streams by `created_at`; `feed` is
//! `replay` with a poll loop; `costs --live` joins the latest metrics
//! snapshots with active sessions.

use serde::Serialize;

use crate::agents::tmux::TmuxClient;
use crate::errors::Result;
use crate::paths::OverstoryHome;
use crate::store::{
    Event, EventFilter, EventLevel, EventStore, EventType, MailFilter, MailStore, MetricsStore,
    Session, SessionMetrics, SessionStore,
};

/// Uniform query options (`--agent --run --since --until --limit`).
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub agent: Option<String>,
    pub run: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<usize>,
}

impl QueryOptions {
    fn filter(&self) -> EventFilter {
        EventFilter {
            agent_name: self.agent.clone(),
            run_id: self.run.clone(),
            since: self.since.clone(),
            until: self.until.clone(),
            limit: self.limit,
            ..EventFilter::default()
        }
    }
}

/// One line of `status` output.
#[derive(Debug, Serialize)]
pub struct StatusRow {
    #[serde(flatten)]
    pub session: Session,
    /// Whether the session's pane actually exists right now.
    pub tmux_alive: bool,
    pub unread_mail: usize,
}

/// Sessions joined with the live tmux inventory; a row whose pane is gone
/// but whose state is still active will read `(gone)` in the rendering.
pub fn status(home: &OverstoryHome, tmux: &dyn TmuxClient) -> Result<Vec<StatusRow>> {
    let sessions = SessionStore::open(&home.sessions_db())?;
    let all = sessions.get_all()?;
    sessions.close();

    let mail = MailStore::open(&home.mail_db())?;
    let mut rows = Vec::with_capacity(all.len());
    for session in all {
        let tmux_alive = tmux.is_session_alive(&session.tmux_session).unwrap_or(false);
        let unread_mail = mail.unread_for(&session.agent_name)?.len();
        rows.push(StatusRow {
            session,
            tmux_alive,
            unread_mail,
        });
    }
    mail.close();
    Ok(rows)
}

/// Tool events for an agent (or everyone), oldest first.
pub fn trace(home: &OverstoryHome, options: &QueryOptions) -> Result<Vec<Event>> {
    let events = EventStore::open(&home.events_db())?;
    let mut filter = options.filter();
    filter.event_type = Some(EventType::ToolStart);
    let mut rows = events.query(&filter)?;
    filter.event_type = Some(EventType::ToolEnd);
    rows.extend(events.query(&filter)?);
    events.close();
    rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    if let Some(limit) = options.limit {
        rows.truncate(limit);
    }
    Ok(rows)
}

/// `level='error'` events, oldest first.
pub fn errors(home: &OverstoryHome, options: &QueryOptions) -> Result<Vec<Event>> {
    let events = EventStore::open(&home.events_db())?;
    let mut filter = options.filter();
    filter.level = Some(EventLevel::Error);
    let rows = events.query(&filter)?;
    events.close();
    Ok(rows)
}

/// All event streams merged by `created_at`.
pub fn replay(home: &OverstoryHome, options: &QueryOptions) -> Result<Vec<Event>> {
    let events = EventStore::open(&home.events_db())?;
    let rows = events.query(&options.filter())?;
    events.close();
    Ok(rows)
}

/// Events strictly after the given cursor (`feed --follow` polling).
pub fn feed_after(home: &OverstoryHome, options: &QueryOptions, after_id: i64) -> Result<Vec<Event>> {
    let rows = replay(home, options)?;
    Ok(rows.into_iter().filter(|e| e.id > after_id).collect())
}

#[derive(Debug, Serialize)]
pub struct CostsReport {
    pub sessions: usize,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cost_usd: f64,
    pub average_duration_ms: Option<f64>,
    /// Only set by `costs --live`.
    pub burn_rate_usd_per_minute: Option<f64>,
    pub rows: Vec<SessionMetrics>,
}

/// Historical cost roll-up, optionally narrowed to one agent or run.
pub fn costs(home: &OverstoryHome, options: &QueryOptions) -> Result<CostsReport> {
    let metrics = MetricsStore::open(&home.metrics_db())?;
    let rows = if let Some(agent) = &options.agent {
        metrics.sessions_by_agent(agent)?
    } else if let Some(run) = &options.run {
        metrics.sessions_by_run(run)?
    } else {
        metrics.recent_sessions(options.limit.unwrap_or(50))?
    };
    let average_duration_ms = metrics.average_duration_ms()?;
    metrics.close();

    Ok(CostsReport {
        sessions: rows.len(),
        total_input_tokens: rows.iter().map(|r| r.input_tokens).sum(),
        total_output_tokens: rows.iter().map(|r| r.output_tokens).sum(),
        total_cost_usd: rows.iter().filter_map(|r| r.estimated_cost_usd).sum(),
        average_duration_ms,
        burn_rate_usd_per_minute: None,
        rows,
    })
}

/// Live burn rate: latest snapshot per active agent, cost summed, divided
/// by the fleet's average elapsed minutes.
pub fn costs_live(home: &OverstoryHome) -> Result<CostsReport> {
    let sessions = SessionStore::open(&home.sessions_db())?;
    let active = sessions.get_active()?;
    sessions.close();

    let metrics = MetricsStore::open(&home.metrics_db())?;
    let snapshots = metrics.latest_snapshots()?;
    metrics.close();

    let now = chrono::Utc::now();
    let mut total_cost = 0.0;
    let mut total_input = 0;
    let mut total_output = 0;
    let mut elapsed_minutes = Vec::new();
    let mut rows = Vec::new();

    for session in &active {
        let Some(snapshot) = snapshots
            .iter()
            .find(|s| s.agent_name == session.agent_name)
        else {
            continue;
        };
        total_cost += snapshot.estimated_cost_usd.unwrap_or(0.0);
        total_input += snapshot.input_tokens;
        total_output += snapshot.output_tokens;
        elapsed_minutes.push((now - session.started_at).num_seconds() as f64 / 60.0);
        rows.push(SessionMetrics {
            agent_name: session.agent_name.clone(),
            capability: session.capability.as_str().to_string(),
            bead_id: session.bead_id.clone(),
            started_at: crate::store::to_iso(session.started_at),
            input_tokens: snapshot.input_tokens,
            output_tokens: snapshot.output_tokens,
            cache_read_tokens: snapshot.cache_read_tokens,
            cache_creation_tokens: snapshot.cache_creation_tokens,
            estimated_cost_usd: snapshot.estimated_cost_usd,
            run_id: session.run_id.clone(),
            ..SessionMetrics::default()
        });
    }

    let burn_rate = if elapsed_minutes.is_empty() {
        None
    } else {
        let avg_minutes =
            elapsed_minutes.iter().sum::<f64>() / elapsed_minutes.len() as f64;
        if avg_minutes > 0.0 {
            Some(total_cost / avg_minutes)
        } else {
            None
        }
    };

    Ok(CostsReport {
        sessions: rows.len(),
        total_input_tokens: total_input,
        total_output_tokens: total_output,
        total_cost_usd: total_cost,
        average_duration_ms: None,
        burn_rate_usd_per_minute: burn_rate,
        rows,
    })
}

#[derive(Debug, Serialize)]
pub struct InspectReport {
    pub session: Session,
    pub recent_events: Vec<Event>,
    pub unread_mail: Vec<crate::store::MailMessage>,
    pub metrics: Vec<SessionMetrics>,
    pub identity: Option<crate::agents::identity::AgentIdentity>,
}

/// One-agent deep view joining session, events, mail, metrics, identity.
pub fn inspect(home: &OverstoryHome, agent: &str) -> Result<Option<InspectReport>> {
    let sessions = SessionStore::open(&home.sessions_db())?;
    let Some(session) = sessions.get_by_name(agent)? else {
        sessions.close();
        return Ok(None);
    };
    sessions.close();

    let events = EventStore::open(&home.events_db())?;
    let recent_events = events.recent_for_agent(agent, 20)?;
    events.close();

    let mail = MailStore::open(&home.mail_db())?;
    let unread_mail = mail.get_all(&MailFilter {
        to: Some(agent.to_string()),
        unread: Some(true),
        ..MailFilter::default()
    })?;
    mail.close();

    let metrics_store = MetricsStore::open(&home.metrics_db())?;
    let metrics = metrics_store.sessions_by_agent(agent)?;
    metrics_store.close();

    Ok(Some(InspectReport {
        session,
        recent_events,
        unread_mail,
        metrics,
        identity: crate::agents::identity::load(home, agent)?,
    }))
}
