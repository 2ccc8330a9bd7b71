//! Comment feed for a single listing view.
//!
//! [`Feed`] owns the page window and the accumulated comments of one listing.
//! Network calls run on background threads and report back over a channel;
//! the owner applies them with [`Feed::poll`] or [`Feed::wait_idle`]. Every
//! state transition is published to subscribers together with the new state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::api::{self, ApiError, ApiResult, Comment, Violation};
use crate::data::CommentService;
use crate::session::AuthContext;

pub const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub limit: usize,
    pub offset: usize,
}

impl Window {
    pub fn first(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            offset: 0,
        }
    }

    pub fn next_offset(&self) -> usize {
        self.offset + self.limit
    }

    /// Offset of the page that holds the item at `index`.
    fn page_of(&self, index: usize) -> usize {
        index / self.limit * self.limit
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::first(DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("request failed: {0}")]
    FetchFailed(String),
    #[error("comment rejected: {}", list_violations(.0))]
    ValidationRejected(Vec<Violation>),
    #[error("sign in to continue")]
    Unauthenticated,
}

fn list_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.description.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl FeedError {
    /// Violations only mean something for create/update; elsewhere they are plain failures.
    fn from_api(err: ApiError, accepts_violations: bool) -> Self {
        match err {
            ApiError::Unauthorized => FeedError::Unauthenticated,
            ApiError::Rejected(violations) if accepts_violations => {
                FeedError::ValidationRejected(violations)
            }
            other => FeedError::FetchFailed(
                other
                    .server_message()
                    .unwrap_or_else(|| other.to_string()),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditSession {
    pub comment_id: i64,
    pub text: String,
    pub violations: Vec<Violation>,
    pub saving: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FeedState {
    pub listing_id: i64,
    pub window: Window,
    pub comments: Vec<Comment>,
    pub total: usize,
    /// Violations from the last rejected submit.
    pub violations: Vec<Violation>,
    pub draft: String,
    pub edit: Option<EditSession>,
    pub error: Option<FeedError>,
    pub loading: bool,
    /// Whether the page at `window.offset` has been applied.
    pub loaded: bool,
    pub submitting: bool,
}

impl FeedState {
    fn new(listing_id: i64, limit: usize) -> Self {
        Self {
            listing_id,
            window: Window::first(limit),
            ..Self::default()
        }
    }

    pub fn can_load_more(&self) -> bool {
        self.loaded && self.window.next_offset() < self.total
    }

    pub fn comment(&self, comment_id: i64) -> Option<&Comment> {
        self.comments.iter().find(|comment| comment.id == comment_id)
    }

    pub fn edit_violations(&self) -> &[Violation] {
        self.edit
            .as_ref()
            .map(|edit| edit.violations.as_slice())
            .unwrap_or_default()
    }

    fn position(&self, comment_id: i64) -> Option<usize> {
        self.comments.iter().position(|comment| comment.id == comment_id)
    }

    /// First page replaces the feed, later pages append.
    fn apply_page(&mut self, offset: usize, page: api::Page<Comment>) {
        if offset == 0 {
            self.comments = page.results;
        } else {
            for comment in page.results {
                match self.position(comment.id) {
                    Some(idx) => self.comments[idx] = comment,
                    None => self.comments.push(comment),
                }
            }
        }
        self.total = page.count;
    }

    /// Refetched rows replace their stale copies where they sit.
    fn apply_refresh(&mut self, offset: usize, page: api::Page<Comment>) {
        for (idx, comment) in page.results.into_iter().enumerate() {
            match self.position(comment.id) {
                Some(existing) => self.comments[existing] = comment,
                None => {
                    let at = (offset + idx).min(self.comments.len());
                    self.comments.insert(at, comment);
                }
            }
        }
        self.total = page.count;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Reset,
    Loading { offset: usize },
    PageLoaded { offset: usize, received: usize },
    Refreshed { offset: usize },
    DraftChanged,
    Submitting,
    Submitted { comment_id: i64 },
    EditStarted { comment_id: i64 },
    EditChanged { comment_id: i64 },
    EditCancelled { comment_id: i64 },
    EditSaved { comment_id: i64 },
    Deleted { comment_id: i64 },
    Liked { comment_id: i64, likes_count: u64 },
    Rejected {
        comment_id: Option<i64>,
        violations: Vec<Violation>,
    },
    Failed(FeedError),
    StaleResponse { request_id: u64 },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&FeedEvent, &FeedState) + Send>;

#[derive(Debug, Clone, Copy)]
pub struct FeedOptions {
    pub page_size: usize,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

struct PendingPage {
    request_id: u64,
    offset: usize,
}

enum Response {
    Page {
        request_id: u64,
        offset: usize,
        result: ApiResult<api::Page<Comment>>,
    },
    Refresh {
        request_id: u64,
        offset: usize,
        result: ApiResult<api::Page<Comment>>,
    },
    Created {
        request_id: u64,
        result: ApiResult<Comment>,
    },
    Updated {
        request_id: u64,
        comment_id: i64,
        result: ApiResult<Comment>,
    },
    Deleted {
        request_id: u64,
        comment_id: i64,
        result: ApiResult<()>,
    },
    Liked {
        request_id: u64,
        comment_id: i64,
        result: ApiResult<api::LikeToggle>,
    },
}

pub struct Feed {
    service: Arc<dyn CommentService>,
    auth: Arc<dyn AuthContext>,
    state: FeedState,
    response_tx: Sender<Response>,
    response_rx: Receiver<Response>,
    next_request_id: u64,
    pending_page: Option<PendingPage>,
    pending_refreshes: HashMap<u64, usize>,
    pending_mutations: HashSet<u64>,
    cancel_flag: Arc<AtomicBool>,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl Feed {
    pub fn new(
        service: Arc<dyn CommentService>,
        auth: Arc<dyn AuthContext>,
        options: FeedOptions,
    ) -> Self {
        let (response_tx, response_rx) = unbounded();
        Self {
            service,
            auth,
            state: FeedState::new(0, options.page_size),
            response_tx,
            response_rx,
            next_request_id: 1,
            pending_page: None,
            pending_refreshes: HashMap::new(),
            pending_mutations: HashSet::new(),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            listeners: Vec::new(),
            next_subscription: 1,
        }
    }

    /// Creates a feed and immediately requests the first page of `listing_id`.
    pub fn open(
        listing_id: i64,
        service: Arc<dyn CommentService>,
        auth: Arc<dyn AuthContext>,
        options: FeedOptions,
    ) -> Self {
        let mut feed = Self::new(service, auth, options);
        feed.initialize(listing_id);
        feed
    }

    pub fn state(&self) -> &FeedState {
        &self.state
    }

    pub fn viewer(&self) -> Option<api::User> {
        self.auth.viewer()
    }

    pub fn is_loading(&self) -> bool {
        self.pending_page.is_some()
    }

    pub fn is_submitting(&self) -> bool {
        self.state.submitting
    }

    pub fn pending_mutations(&self) -> usize {
        self.pending_mutations.len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_page.is_some()
            || !self.pending_refreshes.is_empty()
            || !self.pending_mutations.is_empty()
    }

    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&FeedEvent, &FeedState) + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    /// Starts a fresh view of `listing_id`. Anything still in flight is abandoned.
    pub fn initialize(&mut self, listing_id: i64) {
        self.abandon_in_flight();
        self.pending_mutations.clear();
        self.state = FeedState::new(listing_id, self.state.window.limit);
        self.notify(FeedEvent::Reset);
        self.fetch_page();
    }

    /// Requests the next page. Returns whether a fetch was issued.
    ///
    /// Nothing is fetched once `offset + limit` reaches `total`, including after
    /// a failed load of the last window (or of the first one, while `total` is
    /// still 0); [`Feed::retry`] re-issues those.
    pub fn load_more(&mut self) -> bool {
        if self.pending_page.is_some() {
            return false;
        }
        let next = self.state.window.next_offset();
        if next >= self.state.total {
            return false;
        }
        if !self.state.loaded {
            // The current window never arrived; fetch it again rather than skip it.
            self.fetch_page();
            return true;
        }
        self.state.window.offset = next;
        self.state.loaded = false;
        self.fetch_page();
        true
    }

    /// Re-issues the current window after a failure, or refreshes it in place.
    pub fn retry(&mut self) -> bool {
        if self.pending_page.is_some() {
            return false;
        }
        if self.state.loaded {
            self.refresh(self.state.window.offset);
        } else {
            self.fetch_page();
        }
        true
    }

    pub fn set_draft(&mut self, text: &str) {
        if self.state.draft == text {
            return;
        }
        self.state.draft = text.to_string();
        self.notify(FeedEvent::DraftChanged);
    }

    pub fn submit_comment(&mut self, text: &str) -> bool {
        self.set_draft(text);
        self.submit()
    }

    /// Posts the trimmed draft. Returns whether a request was issued.
    pub fn submit(&mut self) -> bool {
        let content = self.state.draft.trim().to_string();
        if content.is_empty() {
            return false;
        }
        let request_id = self.next_request_id();
        self.pending_mutations.insert(request_id);
        self.state.submitting = true;
        self.state.violations.clear();
        let service = self.service.clone();
        let listing_id = self.state.listing_id;
        tracing::debug!(listing_id, request_id, "submitting comment");
        self.spawn(move || Response::Created {
            request_id,
            result: service.create(listing_id, &content),
        });
        self.notify(FeedEvent::Submitting);
        true
    }

    pub fn begin_edit(&mut self, comment_id: i64) -> bool {
        let Some(comment) = self.state.comment(comment_id) else {
            return false;
        };
        if comment.deleted {
            return false;
        }
        self.state.edit = Some(EditSession {
            comment_id,
            text: comment.content.clone(),
            violations: Vec::new(),
            saving: false,
        });
        self.notify(FeedEvent::EditStarted { comment_id });
        true
    }

    pub fn set_edit_text(&mut self, text: &str) {
        let Some(edit) = self.state.edit.as_mut() else {
            return;
        };
        edit.text = text.to_string();
        let comment_id = edit.comment_id;
        self.notify(FeedEvent::EditChanged { comment_id });
    }

    pub fn cancel_edit(&mut self) {
        if let Some(edit) = self.state.edit.take() {
            self.notify(FeedEvent::EditCancelled {
                comment_id: edit.comment_id,
            });
        }
    }

    /// Sends the edit session's trimmed text. Returns whether a request was issued.
    pub fn save_edit(&mut self) -> bool {
        let Some(edit) = self.state.edit.as_mut() else {
            return false;
        };
        let content = edit.text.trim().to_string();
        if content.is_empty() {
            return false;
        }
        edit.violations.clear();
        edit.saving = true;
        let comment_id = edit.comment_id;
        let request_id = self.next_request_id();
        self.pending_mutations.insert(request_id);
        let service = self.service.clone();
        tracing::debug!(comment_id, request_id, "updating comment");
        self.spawn(move || Response::Updated {
            request_id,
            comment_id,
            result: service.update(comment_id, &content),
        });
        self.notify(FeedEvent::EditChanged { comment_id });
        true
    }

    /// Opens (or reuses) the edit session for `comment_id` with `text` and saves it.
    /// The comment does not have to be on a loaded page.
    pub fn update_comment(&mut self, comment_id: i64, text: &str) -> bool {
        let reuse = matches!(&self.state.edit, Some(edit) if edit.comment_id == comment_id);
        if !reuse && !self.begin_edit(comment_id) {
            self.state.edit = Some(EditSession {
                comment_id,
                text: String::new(),
                violations: Vec::new(),
                saving: false,
            });
            self.notify(FeedEvent::EditStarted { comment_id });
        }
        self.set_edit_text(text);
        self.save_edit()
    }

    pub fn delete_comment(&mut self, comment_id: i64) {
        let request_id = self.next_request_id();
        self.pending_mutations.insert(request_id);
        let service = self.service.clone();
        tracing::debug!(comment_id, request_id, "deleting comment");
        self.spawn(move || Response::Deleted {
            request_id,
            comment_id,
            result: service.remove(comment_id),
        });
    }

    pub fn toggle_like(&mut self, comment_id: i64) {
        let request_id = self.next_request_id();
        self.pending_mutations.insert(request_id);
        let service = self.service.clone();
        tracing::debug!(comment_id, request_id, "toggling like");
        self.spawn(move || Response::Liked {
            request_id,
            comment_id,
            result: service.toggle_like(comment_id),
        });
    }

    /// Applies every response that has already arrived.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(response) = self.response_rx.try_recv() {
            self.handle_response(response);
            changed = true;
        }
        changed
    }

    /// Blocks for at most `timeout` waiting for a single response.
    pub fn poll_timeout(&mut self, timeout: Duration) -> bool {
        match self.response_rx.recv_timeout(timeout) {
            Ok(response) => {
                self.handle_response(response);
                true
            }
            Err(_) => false,
        }
    }

    /// Applies responses until nothing is in flight. Returns `false` on timeout.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.has_pending() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.response_rx.recv_timeout(remaining) {
                Ok(response) => self.handle_response(response),
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
        true
    }

    /// Leaves the view: in-flight work is cancelled and listeners are dropped.
    pub fn close(&mut self) {
        self.abandon_in_flight();
        self.pending_mutations.clear();
        self.notify(FeedEvent::Closed);
        self.listeners.clear();
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn abandon_in_flight(&mut self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
        self.cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending_page = None;
        self.pending_refreshes.clear();
        self.state.loading = false;
    }

    /// Drops pending fetches only; mutations in flight still land.
    fn reset_fetches(&mut self) {
        self.pending_page = None;
        self.pending_refreshes.clear();
        self.state.loading = false;
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() -> Response + Send + 'static,
    {
        let tx = self.response_tx.clone();
        let cancel_flag = self.cancel_flag.clone();
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let response = job();
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(response);
        });
    }

    fn fetch_page(&mut self) {
        let window = self.state.window;
        let request_id = self.next_request_id();
        self.pending_page = Some(PendingPage {
            request_id,
            offset: window.offset,
        });
        self.state.loading = true;
        self.state.error = None;
        let service = self.service.clone();
        let listing_id = self.state.listing_id;
        tracing::debug!(listing_id, offset = window.offset, limit = window.limit, request_id, "fetching comment page");
        self.spawn(move || Response::Page {
            request_id,
            offset: window.offset,
            result: service.list(listing_id, window.limit, window.offset),
        });
        self.notify(FeedEvent::Loading {
            offset: window.offset,
        });
    }

    fn refresh(&mut self, offset: usize) {
        let request_id = self.next_request_id();
        self.pending_refreshes.insert(request_id, offset);
        let service = self.service.clone();
        let listing_id = self.state.listing_id;
        let limit = self.state.window.limit;
        tracing::debug!(listing_id, offset, request_id, "refreshing comment page");
        self.spawn(move || Response::Refresh {
            request_id,
            offset,
            result: service.list(listing_id, limit, offset),
        });
    }

    /// Refetches the page holding `comment_id`, or the current window if it is not loaded.
    fn refresh_around(&mut self, comment_id: i64) {
        let offset = self
            .state
            .position(comment_id)
            .map(|idx| self.state.window.page_of(idx))
            .unwrap_or(self.state.window.offset);
        self.refresh(offset);
    }

    fn fail(&mut self, error: FeedError) {
        if error == FeedError::Unauthenticated {
            self.auth.invalidate();
        }
        self.state.error = Some(error.clone());
        self.notify(FeedEvent::Failed(error));
    }

    /// A failed page load stays reported until that window is fetched again.
    fn clear_error(&mut self) {
        if self.state.loaded {
            self.state.error = None;
        }
    }

    fn stale(&mut self, request_id: u64) {
        tracing::warn!(request_id, "discarding stale comment response");
        self.notify(FeedEvent::StaleResponse { request_id });
    }

    fn handle_response(&mut self, response: Response) {
        match response {
            Response::Page {
                request_id,
                offset,
                result,
            } => {
                let Some(pending) = &self.pending_page else {
                    return self.stale(request_id);
                };
                if pending.request_id != request_id
                    || pending.offset != offset
                    || offset != self.state.window.offset
                {
                    return self.stale(request_id);
                }
                self.pending_page = None;
                self.state.loading = false;

                match result {
                    Ok(page) => {
                        let received = page.results.len();
                        self.state.apply_page(offset, page);
                        self.state.loaded = true;
                        self.notify(FeedEvent::PageLoaded { offset, received });
                    }
                    Err(err) => self.fail(FeedError::from_api(err, false)),
                }
            }
            Response::Refresh {
                request_id,
                offset,
                result,
            } => {
                if self.pending_refreshes.remove(&request_id).is_none() {
                    return self.stale(request_id);
                }
                match result {
                    Ok(page) => {
                        self.state.apply_refresh(offset, page);
                        self.clear_error();
                        self.notify(FeedEvent::Refreshed { offset });
                    }
                    Err(err) => self.fail(FeedError::from_api(err, false)),
                }
            }
            Response::Created { request_id, result } => {
                if !self.pending_mutations.remove(&request_id) {
                    return self.stale(request_id);
                }
                self.state.submitting = false;
                match result {
                    Ok(comment) => {
                        self.state.draft.clear();
                        self.state.violations.clear();
                        self.state.error = None;
                        self.notify(FeedEvent::Submitted {
                            comment_id: comment.id,
                        });
                        self.reset_fetches();
                        self.state.window.offset = 0;
                        self.state.loaded = false;
                        self.fetch_page();
                    }
                    Err(err) => match FeedError::from_api(err, true) {
                        FeedError::ValidationRejected(violations) => {
                            self.state.violations = violations.clone();
                            self.notify(FeedEvent::Rejected {
                                comment_id: None,
                                violations,
                            });
                        }
                        other => self.fail(other),
                    },
                }
            }
            Response::Updated {
                request_id,
                comment_id,
                result,
            } => {
                if !self.pending_mutations.remove(&request_id) {
                    return self.stale(request_id);
                }
                let editing = matches!(&self.state.edit, Some(edit) if edit.comment_id == comment_id);
                match result {
                    Ok(_) => {
                        if editing {
                            self.state.edit = None;
                        }
                        self.state.violations.clear();
                        self.clear_error();
                        self.notify(FeedEvent::EditSaved { comment_id });
                        self.refresh_around(comment_id);
                    }
                    Err(err) => {
                        if let Some(edit) = self.state.edit.as_mut().filter(|_| editing) {
                            edit.saving = false;
                        }
                        match FeedError::from_api(err, true) {
                            FeedError::ValidationRejected(violations) => {
                                if let Some(edit) = self.state.edit.as_mut().filter(|_| editing) {
                                    edit.violations = violations.clone();
                                }
                                self.notify(FeedEvent::Rejected {
                                    comment_id: Some(comment_id),
                                    violations,
                                });
                            }
                            other => self.fail(other),
                        }
                    }
                }
            }
            Response::Deleted {
                request_id,
                comment_id,
                result,
            } => {
                if !self.pending_mutations.remove(&request_id) {
                    return self.stale(request_id);
                }
                match result {
                    Ok(()) => {
                        if matches!(&self.state.edit, Some(edit) if edit.comment_id == comment_id) {
                            self.state.edit = None;
                        }
                        self.state.violations.clear();
                        self.clear_error();
                        self.notify(FeedEvent::Deleted { comment_id });
                        self.refresh_around(comment_id);
                    }
                    Err(err) => self.fail(FeedError::from_api(err, false)),
                }
            }
            Response::Liked {
                request_id,
                comment_id,
                result,
            } => {
                if !self.pending_mutations.remove(&request_id) {
                    return self.stale(request_id);
                }
                match result {
                    Ok(toggle) => {
                        self.state.violations.clear();
                        self.clear_error();
                        self.notify(FeedEvent::Liked {
                            comment_id,
                            likes_count: toggle.likes_count,
                        });
                        self.refresh_around(comment_id);
                    }
                    Err(err) => self.fail(FeedError::from_api(err, false)),
                }
            }
        }
    }

    fn notify(&mut self, event: FeedEvent) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(&event, &self.state);
        }
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MockCommentService;
    use crate::session::Anonymous;
    use crossbeam_channel::bounded;
    use parking_lot::Mutex;

    const LISTING: i64 = 42;
    const WAIT: Duration = Duration::from_secs(5);

    fn open(service: &Arc<MockCommentService>) -> Feed {
        let mut feed = Feed::open(
            LISTING,
            service.clone(),
            Arc::new(Anonymous),
            FeedOptions::default(),
        );
        assert!(feed.wait_idle(WAIT));
        feed
    }

    fn ids(feed: &Feed) -> Vec<i64> {
        feed.state().comments.iter().map(|c| c.id).collect()
    }

    #[test]
    fn pages_accumulate_until_total() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 25));
        let mut feed = open(&service);
        assert_eq!(feed.state().comments.len(), 10);
        assert_eq!(feed.state().total, 25);
        assert!(feed.state().can_load_more());

        assert!(feed.load_more());
        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.state().window.offset, 10);
        assert_eq!(feed.state().comments.len(), 20);

        assert!(feed.load_more());
        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.state().window.offset, 20);
        assert_eq!(feed.state().comments.len(), 25);
        assert!(!feed.state().can_load_more());

        let mut seen = ids(&feed);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 25);
    }

    #[test]
    fn accumulated_length_is_bounded_by_total() {
        for total in [0usize, 1, 9, 10, 11, 30, 47] {
            let service = Arc::new(MockCommentService::with_comments(LISTING, total));
            let mut feed = open(&service);
            let mut pages = 1;
            assert_eq!(feed.state().comments.len(), (pages * 10).min(total));
            while feed.load_more() {
                assert!(feed.wait_idle(WAIT));
                pages += 1;
                assert_eq!(feed.state().comments.len(), (pages * 10).min(total));
            }
            let mut seen = ids(&feed);
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), total);
        }
    }

    #[test]
    fn load_more_past_the_end_issues_no_fetch() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 10));
        let mut feed = open(&service);
        let calls = service.list_calls();
        assert!(!feed.load_more());
        assert!(!feed.has_pending());
        assert_eq!(service.list_calls(), calls);
        assert_eq!(feed.state().window.offset, 0);
    }

    #[test]
    fn load_more_waits_for_the_page_in_flight() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 25));
        let mut feed = open(&service);
        assert!(feed.load_more());
        assert!(!feed.load_more());
        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.state().window.offset, 10);
        assert_eq!(feed.state().comments.len(), 20);
    }

    #[test]
    fn submit_replaces_feed_with_first_page() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 25));
        let mut feed = open(&service);
        feed.load_more();
        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.state().comments.len(), 20);

        assert!(feed.submit_comment("  new comment  "));
        assert!(feed.is_submitting());
        assert!(feed.wait_idle(WAIT));

        let state = feed.state();
        assert_eq!(state.window.offset, 0);
        assert_eq!(state.total, 26);
        assert!(state.draft.is_empty());
        let expected: Vec<i64> = service
            .list(LISTING, 10, 0)
            .unwrap()
            .results
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids(&feed), expected);
        assert_eq!(feed.state().comments[0].content, "new comment");
    }

    #[test]
    fn blank_draft_is_not_submitted() {
        let service = Arc::new(MockCommentService::default());
        let mut feed = open(&service);
        assert!(!feed.submit_comment("   \n"));
        assert!(!feed.has_pending());
    }

    #[test]
    fn rejected_submit_keeps_draft_and_violations() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 3));
        service.ban_word(1, "спам", "запрещённое слово");
        let mut feed = open(&service);
        let calls = service.list_calls();

        feed.submit_comment("купите спам");
        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.state().draft, "купите спам");
        assert_eq!(
            feed.state().violations,
            vec![Violation {
                id: 1,
                description: "запрещённое слово".into()
            }]
        );
        assert_eq!(service.list_calls(), calls);
        assert_eq!(feed.state().comments.len(), 3);

        feed.submit_comment("купите велосипед");
        assert!(feed.wait_idle(WAIT));
        assert!(feed.state().violations.is_empty());
        assert!(feed.state().draft.is_empty());
        assert_eq!(feed.state().comments.len(), 4);
    }

    #[test]
    fn like_shows_server_count_after_refetch() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 5));
        let mut feed = open(&service);
        let target = feed.state().comments[2].id;
        assert_eq!(feed.state().comments[2].likes_count, 0);

        // Other viewers liked it meanwhile; this client never saw those.
        service.set_likes(target, 3);
        feed.toggle_like(target);
        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.state().comment(target).unwrap().likes_count, 4);
        assert_eq!(feed.state().comments.len(), 5);
    }

    #[test]
    fn rejected_edit_stays_open_with_violation() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 4));
        service.ban_word(1, "плохое", "запрещённое слово");
        let mut feed = open(&service);
        let own = feed
            .state()
            .comments
            .iter()
            .find(|c| c.is_owner)
            .unwrap()
            .id;

        assert!(feed.begin_edit(own));
        feed.set_edit_text("плохое слово");
        assert!(feed.save_edit());
        assert!(feed.wait_idle(WAIT));

        let edit = feed.state().edit.as_ref().unwrap();
        assert_eq!(edit.comment_id, own);
        assert!(!edit.saving);
        assert_eq!(feed.state().edit_violations().len(), 1);
        assert_eq!(
            feed.state().edit_violations()[0].description,
            "запрещённое слово"
        );

        feed.set_edit_text("хорошее слово");
        assert!(feed.save_edit());
        assert!(feed.state().edit_violations().is_empty());
        assert!(feed.wait_idle(WAIT));
        assert!(feed.state().edit.is_none());
        let comment = feed.state().comment(own).unwrap();
        assert_eq!(comment.content, "хорошее слово");
        assert!(comment.edited);
    }

    #[test]
    fn cancelled_edit_sends_nothing() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 4));
        let mut feed = open(&service);
        let own = feed
            .state()
            .comments
            .iter()
            .find(|c| c.is_owner)
            .unwrap()
            .id;
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        feed.subscribe(move |event, _| sink.lock().push(event.clone()));

        assert!(feed.begin_edit(own));
        feed.set_edit_text("черновик правки");
        feed.cancel_edit();
        assert!(feed.state().edit.is_none());
        assert!(!feed.save_edit());
        assert!(!feed.has_pending());
        assert_eq!(service.comment(own).unwrap().content, format!("comment #{own}"));
        assert_eq!(
            events.lock().last(),
            Some(&FeedEvent::EditCancelled { comment_id: own })
        );

        feed.cancel_edit();
        assert_eq!(events.lock().len(), 3);
    }

    #[test]
    fn update_keeps_window_and_rows() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 25));
        let mut feed = open(&service);
        feed.load_more();
        assert!(feed.wait_idle(WAIT));
        let before = ids(&feed);
        let own_on_first_page = feed.state().comments[0].id;

        assert!(feed.update_comment(own_on_first_page, "edited text"));
        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.state().window.offset, 10);
        assert_eq!(ids(&feed), before);
        assert_eq!(
            feed.state().comment(own_on_first_page).unwrap().content,
            "edited text"
        );
    }

    #[test]
    fn delete_is_reflected_by_refetch() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 3));
        let mut feed = open(&service);
        let own = feed.state().comments[0].id;
        feed.delete_comment(own);
        assert!(feed.wait_idle(WAIT));
        let comment = feed.state().comment(own).unwrap();
        assert!(comment.deleted);
        assert_eq!(comment.content, crate::data::DELETED_PLACEHOLDER);
        assert_eq!(feed.state().comments.len(), 3);
    }

    #[test]
    fn fetch_failure_keeps_feed_and_retry_recovers() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 25));
        let mut feed = open(&service);
        service.set_offline(true);
        feed.load_more();
        assert!(feed.wait_idle(WAIT));
        assert!(matches!(feed.state().error, Some(FeedError::FetchFailed(_))));
        assert_eq!(feed.state().comments.len(), 10);
        assert_eq!(feed.state().total, 25);
        assert!(!feed.state().can_load_more());

        service.set_offline(false);
        assert!(feed.retry());
        assert!(feed.wait_idle(WAIT));
        assert!(feed.state().error.is_none());
        assert_eq!(feed.state().comments.len(), 20);
    }

    #[test]
    fn failed_delete_and_like_leave_rows_untouched() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 5));
        let mut feed = open(&service);
        let own = feed.state().comments[0].id;
        let before = feed.state().comments.clone();
        service.set_offline(true);

        feed.delete_comment(own);
        assert!(feed.wait_idle(WAIT));
        assert_eq!(
            feed.state().error,
            Some(FeedError::FetchFailed("Service unavailable.".into()))
        );
        assert_eq!(feed.state().comments, before);

        feed.toggle_like(own);
        assert_eq!(feed.pending_mutations(), 1);
        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.pending_mutations(), 0);
        assert!(matches!(feed.state().error, Some(FeedError::FetchFailed(_))));
        assert_eq!(feed.state().comments, before);

        let stored = service.comment(own).unwrap();
        assert!(!stored.deleted);
        assert_eq!(stored.likes_count, 0);
    }

    #[test]
    fn successful_like_clears_earlier_failure() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 3));
        let mut feed = open(&service);
        let target = feed.state().comments[1].id;

        service.set_offline(true);
        feed.toggle_like(target);
        assert!(feed.wait_idle(WAIT));
        assert!(feed.state().error.is_some());

        service.set_offline(false);
        feed.toggle_like(target);
        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.state().comment(target).unwrap().likes_count, 1);
        assert!(feed.state().error.is_none());
    }

    #[test]
    fn violations_cleared_by_later_mutations() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 3));
        service.ban_word(1, "спам", "запрещённое слово");
        let mut feed = open(&service);

        feed.submit_comment("спам");
        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.state().violations.len(), 1);

        // A new attempt starts without the previous verdict.
        feed.submit_comment("снова спам");
        assert!(feed.state().violations.is_empty());
        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.state().violations.len(), 1);

        feed.toggle_like(feed.state().comments[1].id);
        assert!(feed.wait_idle(WAIT));
        assert!(feed.state().violations.is_empty());

        feed.submit_comment("спам");
        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.state().violations.len(), 1);
        feed.delete_comment(feed.state().comments[0].id);
        assert!(feed.wait_idle(WAIT));
        assert!(feed.state().violations.is_empty());
        assert!(feed.state().draft.contains("спам"));
    }

    #[test]
    fn load_more_after_failed_first_page_leaves_it_to_retry() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 25));
        service.set_offline(true);
        let mut feed = open(&service);
        assert_eq!(feed.state().total, 0);
        assert!(feed.state().error.is_some());

        let calls = service.list_calls();
        assert!(!feed.load_more());
        assert_eq!(service.list_calls(), calls);

        service.set_offline(false);
        assert!(feed.retry());
        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.state().comments.len(), 10);
        assert!(feed.load_more());
        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.state().comments.len(), 20);
    }

    #[test]
    fn unauthenticated_mutation_invalidates_session() {
        struct Tracking(Mutex<bool>);
        impl AuthContext for Tracking {
            fn viewer(&self) -> Option<api::User> {
                None
            }
            fn invalidate(&self) {
                *self.0.lock() = true;
            }
        }

        let service = Arc::new(MockCommentService::with_comments(LISTING, 2));
        service.set_signed_in(false);
        let auth = Arc::new(Tracking(Mutex::new(false)));
        let mut feed = Feed::open(LISTING, service.clone(), auth.clone(), FeedOptions::default());
        assert!(feed.wait_idle(WAIT));

        feed.submit_comment("hello");
        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.state().error, Some(FeedError::Unauthenticated));
        assert_eq!(feed.state().draft, "hello");
        assert!(*auth.0.lock());
    }

    #[test]
    fn page_response_for_another_window_is_discarded() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 25));
        let mut feed = open(&service);
        let before = ids(&feed);
        assert!(feed.load_more());
        let pending_id = feed.pending_page.as_ref().unwrap().request_id;

        let bogus = service.list(LISTING, 10, 20).unwrap();
        feed.handle_response(Response::Page {
            request_id: pending_id,
            offset: 20,
            result: Ok(bogus.clone()),
        });
        feed.handle_response(Response::Page {
            request_id: pending_id + 100,
            offset: 10,
            result: Ok(bogus),
        });
        assert_eq!(ids(&feed), before);
        assert!(feed.is_loading());

        assert!(feed.wait_idle(WAIT));
        assert_eq!(feed.state().comments.len(), 20);
    }

    /// Holds back the second page until the test releases it.
    struct GatedService {
        inner: Arc<MockCommentService>,
        gate: Receiver<()>,
    }

    impl CommentService for GatedService {
        fn list(&self, listing_id: i64, limit: usize, offset: usize) -> ApiResult<api::Page<Comment>> {
            if offset == 10 {
                let _ = self.gate.recv_timeout(WAIT);
            }
            self.inner.list(listing_id, limit, offset)
        }
        fn create(&self, listing_id: i64, content: &str) -> ApiResult<Comment> {
            self.inner.create(listing_id, content)
        }
        fn update(&self, comment_id: i64, content: &str) -> ApiResult<Comment> {
            self.inner.update(comment_id, content)
        }
        fn remove(&self, comment_id: i64) -> ApiResult<()> {
            self.inner.remove(comment_id)
        }
        fn toggle_like(&self, comment_id: i64) -> ApiResult<api::LikeToggle> {
            self.inner.toggle_like(comment_id)
        }
    }

    #[test]
    fn slow_page_cannot_overwrite_reset_feed() {
        let inner = Arc::new(MockCommentService::with_comments(LISTING, 25));
        let (release, gate) = bounded(1);
        let service = Arc::new(GatedService {
            inner: inner.clone(),
            gate,
        });
        let mut feed = Feed::open(LISTING, service, Arc::new(Anonymous), FeedOptions::default());
        assert!(feed.wait_idle(WAIT));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        feed.subscribe(move |event, _| sink.lock().push(event.clone()));

        // Page two hangs while a submit resets the feed to page one.
        assert!(feed.load_more());
        feed.submit_comment("first!");
        assert!(feed.wait_idle(WAIT));
        let first_page = ids(&feed);
        assert_eq!(feed.state().window.offset, 0);
        assert_eq!(first_page.len(), 10);

        release.send(()).unwrap();
        assert!(feed.poll_timeout(WAIT));
        assert_eq!(ids(&feed), first_page);
        assert_eq!(feed.state().window.offset, 0);
        assert!(events
            .lock()
            .iter()
            .any(|event| matches!(event, FeedEvent::StaleResponse { .. })));
    }

    #[test]
    fn closed_feed_ignores_late_responses() {
        let inner = Arc::new(MockCommentService::with_comments(LISTING, 25));
        let (release, gate) = bounded(1);
        let service = Arc::new(GatedService { inner, gate });
        let mut feed = Feed::open(LISTING, service, Arc::new(Anonymous), FeedOptions::default());
        assert!(feed.wait_idle(WAIT));
        assert!(feed.load_more());
        feed.close();
        assert!(!feed.has_pending());

        release.send(()).unwrap();
        assert!(!feed.poll_timeout(Duration::from_millis(200)));
        assert_eq!(feed.state().comments.len(), 10);
    }

    #[test]
    fn subscribers_see_every_transition() {
        let service = Arc::new(MockCommentService::with_comments(LISTING, 12));
        let mut feed = Feed::new(service, Arc::new(Anonymous), FeedOptions { page_size: 5 });
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let id = feed.subscribe(move |event, state| sink.lock().push((event.clone(), state.comments.len())));

        feed.initialize(LISTING);
        assert!(feed.wait_idle(WAIT));
        feed.set_draft("hi");
        assert!(feed.unsubscribe(id));
        feed.set_draft("hi there");

        let events = events.lock();
        assert_eq!(
            *events,
            vec![
                (FeedEvent::Reset, 0),
                (FeedEvent::Loading { offset: 0 }, 0),
                (
                    FeedEvent::PageLoaded {
                        offset: 0,
                        received: 5
                    },
                    5
                ),
                (FeedEvent::DraftChanged, 5),
            ]
        );
    }

    #[test]
    fn apply_refresh_replaces_rows_in_place() {
        let service = MockCommentService::with_comments(LISTING, 4);
        let mut state = FeedState::new(LISTING, 2);
        state.apply_page(0, service.list(LISTING, 2, 0).unwrap());
        state.apply_page(2, service.list(LISTING, 2, 2).unwrap());
        service.set_likes(3, 7);

        state.apply_refresh(2, service.list(LISTING, 2, 2).unwrap());
        assert_eq!(
            state.comments.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        assert_eq!(state.comment(3).unwrap().likes_count, 7);
        assert_eq!(state.window.page_of(3), 2);
    }
}
