//! Command implementations.
//!
//! Catalogue commands print JSON on stdout. Anything served from an
//! expired cache entry is flagged on stderr. Publisher commands load the
//! saved session, and save it back afterwards whether or not the call
//! succeeded, since a call may refresh or clear the credentials.

use anyhow::{anyhow, bail, Context as _, Result};
use chrono::{NaiveDate, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use snapcache_core::api::client::{filter_metadata, METADATA_FIELDS};
use snapcache_core::auth::{build_header, empty_session, Identity, SessionFile};
use snapcache_core::models::MetricsQuery;
use snapcache_core::{ApiError, Fetched, SearchPage, Session, StoreClient};

use crate::cli::{AccountArgs, LoginArgs, MetadataArgs, MetricsArgs, SearchArgs};

pub struct Context {
    pub client: StoreClient,
    pub sessions: SessionFile,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_stale<T>(what: &str, fetched: &Fetched<T>) {
    if fetched.is_stale_due_to_error {
        eprintln!("warning: store unreachable, showing cached {}", what);
    }
}

/// What the user can do about an error, if anything.
fn hint(error: &ApiError) -> Option<&'static str> {
    match error.redirect_path()? {
        "/login" => Some("run `snapcache login` first"),
        "/account/username" => Some("choose one with `snapcache account --set-username <name>`"),
        "/account/agreement" => Some("accept it with `snapcache account --accept-agreement`"),
        _ => None,
    }
}

fn with_hint<T>(result: Result<T, ApiError>) -> Result<T> {
    result.map_err(|e| match hint(&e) {
        Some(hint) => anyhow!("{} ({})", e, hint),
        None => anyhow::Error::new(e),
    })
}

/// Parse `key=value`; values that are valid JSON keep their type.
fn parse_assignment(assignment: &str) -> Result<(String, Value)> {
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got {:?}", assignment))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.trim().to_string(), value))
}

fn metrics_query(today: NaiveDate, days: i64) -> Result<MetricsQuery> {
    if days <= 0 {
        bail!("--days must be positive");
    }
    MetricsQuery::installed_base_by_country("", today, days)
        .ok_or_else(|| anyhow!("--days {} reaches past the supported date range", days))
}

impl Context {
    // ===== Catalogue =====

    pub async fn details(&self, names: &[String]) -> Result<()> {
        let fetched = with_hint(try_join_all(names.iter().map(|name| self.client.snap_details(name))).await)?;
        for (name, details) in names.iter().zip(&fetched) {
            report_stale(&format!("details for {}", name), details);
        }
        let details: Vec<_> = fetched.iter().map(|f| &f.data).collect();
        print_json(&details)
    }

    pub async fn search(&self, args: &SearchArgs) -> Result<()> {
        let page = SearchPage {
            size: args.size,
            offset: args.offset,
        };
        let results = with_hint(self.client.search(&args.query, page).await)?;
        report_stale("search results", &results);
        print_json(&results.data.snaps())
    }

    pub async fn featured(&self) -> Result<()> {
        let featured = with_hint(self.client.featured_snaps().await)?;
        report_stale("featured snaps", &featured);
        print_json(&featured.data)
    }

    pub async fn promoted(&self) -> Result<()> {
        let promoted = with_hint(self.client.promoted_snaps().await)?;
        report_stale("promoted snaps", &promoted);
        print_json(&promoted.data)
    }

    pub async fn metrics(&self, args: &MetricsArgs) -> Result<()> {
        // Window is validated before the snap id lookup
        let mut query = metrics_query(Utc::now().date_naive(), args.days)?;
        query.snap_id = with_hint(self.client.snap_id(&args.name).await)?;
        let metrics = with_hint(self.client.metrics(&[query]).await)?;
        report_stale("metrics", &metrics);

        let mut averages = Map::new();
        for response in &metrics.data {
            for series in &response.series {
                if let Some(average) = series.average() {
                    averages.insert(series.name.clone(), Value::from(average));
                }
            }
        }
        print_json(&averages)
    }

    // ===== Session =====

    pub async fn login(&self, args: &LoginArgs) -> Result<()> {
        let mut session = self.sessions.load()?;

        if args.begin {
            empty_session(&mut session);
            let caveat_id = with_hint(self.client.begin_login(&mut session).await)?;
            self.sessions.save(&session)?;
            println!("{}", caveat_id);
            eprintln!("Have the SSO discharge this caveat, then run `snapcache login --discharge <macaroon>`");
            return Ok(());
        }

        let root = match (&args.root, &session.macaroon_root) {
            (Some(root), _) => root.clone(),
            (None, Some(root)) => root.clone(),
            (None, None) => bail!("no root macaroon; pass --root or run `snapcache login --begin`"),
        };
        let discharge = args
            .discharge
            .clone()
            .ok_or_else(|| anyhow!("--discharge is required to complete a login"))?;
        build_header(&root, &discharge).context("Credentials are not valid macaroons")?;

        let identity = Identity {
            nickname: args.nickname.clone(),
            fullname: args.fullname.clone(),
            email: args.email.clone(),
            ..Default::default()
        };
        session.set_root(root);
        session.complete_login(identity, discharge);
        self.sessions.save(&session)?;
        eprintln!("Logged in");
        Ok(())
    }

    /// Forget the credentials and every cached response.
    pub async fn logout(&self) -> Result<()> {
        self.sessions.clear()?;
        self.client
            .accessor()
            .cache()
            .clear()
            .await
            .context("Failed to clear the response cache")?;
        eprintln!("Logged out");
        Ok(())
    }

    pub fn whoami(&self) -> Result<()> {
        let session = self.sessions.load()?;
        if !session.is_authenticated() {
            println!("Not logged in");
            return Ok(());
        }
        print_json(&session.identity)
    }

    fn authenticated_session(&self) -> Result<Session> {
        let session = self.sessions.load()?;
        if !session.is_authenticated() {
            bail!("Not logged in (run `snapcache login` first)");
        }
        Ok(session)
    }

    /// Persist whatever the call did to the session, then surface its result.
    fn finish<T>(&self, session: &Session, result: Result<T, ApiError>) -> Result<T> {
        self.sessions.save(session)?;
        if !session.is_authenticated() {
            debug!("Session cleared by the store");
        }
        with_hint(result)
    }

    // ===== Publisher =====

    pub async fn account(&self, args: &AccountArgs) -> Result<()> {
        let mut session = self.authenticated_session()?;

        if args.accept_agreement {
            let result = self.client.accept_agreement(&mut session).await;
            self.finish(&session, result)?;
        }
        if let Some(username) = &args.set_username {
            let result = self.client.set_username(&mut session, username).await;
            self.finish(&session, result)?;
        }

        let result = self.client.account(&mut session).await;
        let account = self.finish(&session, result)?;
        report_stale("account", &account);
        print_json(&account.data)
    }

    pub async fn status(&self, name: &str) -> Result<()> {
        let snap_id = with_hint(self.client.snap_id(name).await)?;
        let mut session = self.authenticated_session()?;
        let result = self.client.snap_status(&mut session, &snap_id).await;
        let status = self.finish(&session, result)?;
        report_stale("status", &status);
        print_json(&status.data)
    }

    pub async fn metadata(&self, args: &MetadataArgs) -> Result<()> {
        let snap_id = with_hint(self.client.snap_id(&args.name).await)?;
        let mut session = self.authenticated_session()?;

        if args.set.is_empty() {
            let result = self.client.snap_metadata(&mut session, &snap_id).await;
            let metadata = self.finish(&session, result)?;
            report_stale("metadata", &metadata);
            return print_json(&metadata.data);
        }

        let mut changes = Map::new();
        for assignment in &args.set {
            let (key, value) = parse_assignment(assignment)?;
            changes.insert(key, value);
        }
        let accepted = filter_metadata(&changes);
        for key in changes.keys().filter(|key| !accepted.contains_key(*key)) {
            warn!(field = %key, "Ignoring field that cannot be updated");
        }
        if accepted.is_empty() {
            bail!("nothing to update; editable fields are {}", METADATA_FIELDS.join(", "));
        }

        let result = self
            .client
            .update_snap_metadata(&mut session, &snap_id, &accepted)
            .await;
        let updated = self.finish(&session, result)?;
        print_json(&updated)
    }
}
