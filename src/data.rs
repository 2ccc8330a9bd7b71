use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use reqwest::StatusCode;
use url::Url;

use crate::api::{self, ApiError, ApiResult, PageOptions};

/// Text the backend substitutes for the body of a soft-deleted comment.
pub const DELETED_PLACEHOLDER: &str = "Комментарий удалён пользователем";

pub trait ListingService: Send + Sync {
    fn popular(&self, limit: usize) -> Result<Vec<api::ListingSummary>>;
    fn by_url(&self, url: &str) -> Result<api::Listing>;
    fn detail(&self, id: i64) -> Result<api::Listing>;
}

pub trait CommentService: Send + Sync {
    fn list(&self, listing_id: i64, limit: usize, offset: usize) -> ApiResult<api::Page<api::Comment>>;
    fn create(&self, listing_id: i64, content: &str) -> ApiResult<api::Comment>;
    fn update(&self, comment_id: i64, content: &str) -> ApiResult<api::Comment>;
    fn remove(&self, comment_id: i64) -> ApiResult<()>;
    fn toggle_like(&self, comment_id: i64) -> ApiResult<api::LikeToggle>;
}

pub trait AuthService: Send + Sync {
    fn login(&self, username: &str, password: &str) -> ApiResult<api::AuthResponse>;
    fn register(&self, username: &str, password: &str) -> ApiResult<api::AuthResponse>;
    fn me(&self) -> ApiResult<api::User>;
}

/// Trims a pasted marketplace link and checks that it is an absolute web URL.
pub fn normalize_listing_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("listing url is required");
    }
    let parsed = Url::parse(trimmed).with_context(|| format!("invalid listing url: {trimmed}"))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        bail!("invalid listing url: {trimmed}");
    }
    Ok(trimmed.to_string())
}

pub struct ApiListingService {
    client: Arc<api::Client>,
}

impl ApiListingService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl ListingService for ApiListingService {
    fn popular(&self, limit: usize) -> Result<Vec<api::ListingSummary>> {
        self.client
            .popular_listings(Some(limit))
            .context("fetch popular listings")
    }

    fn by_url(&self, url: &str) -> Result<api::Listing> {
        let url = normalize_listing_url(url)?;
        match self.client.listing_by_url(&url) {
            Ok(listing) => Ok(listing),
            Err(err) => match err.server_message() {
                Some(message) => bail!("look up listing by url: {message}"),
                None => Err(err).context("look up listing by url"),
            },
        }
    }

    fn detail(&self, id: i64) -> Result<api::Listing> {
        self.client
            .listing(id)
            .with_context(|| format!("fetch listing {id}"))
    }
}

pub struct ApiCommentService {
    client: Arc<api::Client>,
}

impl ApiCommentService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl CommentService for ApiCommentService {
    fn list(&self, listing_id: i64, limit: usize, offset: usize) -> ApiResult<api::Page<api::Comment>> {
        self.client
            .comments(listing_id, PageOptions::window(limit, offset))
    }

    fn create(&self, listing_id: i64, content: &str) -> ApiResult<api::Comment> {
        self.client.create_comment(listing_id, content)
    }

    fn update(&self, comment_id: i64, content: &str) -> ApiResult<api::Comment> {
        self.client.update_comment(comment_id, Some(content))
    }

    fn remove(&self, comment_id: i64) -> ApiResult<()> {
        self.client.delete_comment(comment_id)
    }

    fn toggle_like(&self, comment_id: i64) -> ApiResult<api::LikeToggle> {
        self.client.toggle_like(comment_id)
    }
}

pub struct ApiAuthService {
    client: Arc<api::Client>,
}

impl ApiAuthService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

impl AuthService for ApiAuthService {
    fn login(&self, username: &str, password: &str) -> ApiResult<api::AuthResponse> {
        self.client.login(username, password)
    }

    fn register(&self, username: &str, password: &str) -> ApiResult<api::AuthResponse> {
        self.client.register(username, password)
    }

    fn me(&self) -> ApiResult<api::User> {
        self.client.me()
    }
}

#[derive(Default)]
pub struct MockListingService;

impl ListingService for MockListingService {
    fn popular(&self, limit: usize) -> Result<Vec<api::ListingSummary>> {
        Ok(mock_listings()
            .into_iter()
            .take(limit)
            .map(|listing| api::ListingSummary {
                id: listing.id,
                title: listing.title,
                image_url: listing.image_url,
                price: listing.price,
                view_count: listing.view_count,
            })
            .collect())
    }

    fn by_url(&self, url: &str) -> Result<api::Listing> {
        let url = normalize_listing_url(url)?;
        Ok(mock_listings()
            .into_iter()
            .find(|listing| listing.avito_url == url)
            .unwrap_or_else(|| api::Listing {
                id: 100,
                avito_url: url,
                title: "Imported listing".into(),
                image_url: None,
                price: None,
                description: String::new(),
                view_count: 0,
                created_at: Some(Utc::now()),
                updated_at: Some(Utc::now()),
            }))
    }

    fn detail(&self, id: i64) -> Result<api::Listing> {
        mock_listings()
            .into_iter()
            .find(|listing| listing.id == id)
            .with_context(|| format!("listing {id} not found"))
    }
}

fn mock_listings() -> Vec<api::Listing> {
    vec![
        api::Listing {
            id: 1,
            avito_url: "https://www.avito.ru/moskva/velosipedy/gornyy_velosiped_1".into(),
            title: "Горный велосипед".into(),
            image_url: None,
            price: Some("15000.00".into()),
            description: "Sample listing for offline browsing.".into(),
            view_count: 42,
            created_at: None,
            updated_at: None,
        },
        api::Listing {
            id: 2,
            avito_url: "https://www.avito.ru/moskva/mebel/divan_2".into(),
            title: "Диван".into(),
            image_url: None,
            price: None,
            description: String::new(),
            view_count: 7,
            created_at: None,
            updated_at: None,
        },
    ]
}

#[derive(Debug, Clone)]
struct BannedWord {
    id: i64,
    pattern: String,
    description: String,
}

#[derive(Default)]
struct MockComments {
    comments: HashMap<i64, Vec<api::Comment>>,
    banned: Vec<BannedWord>,
    likes: HashSet<i64>,
    next_id: i64,
    offline: bool,
    signed_in: bool,
}

/// In-memory comment backend with moderation, soft deletes and like toggling.
/// Newest comments come first, as the real backend orders them.
pub struct MockCommentService {
    inner: Mutex<MockComments>,
    list_calls: AtomicUsize,
}

impl Default for MockCommentService {
    fn default() -> Self {
        Self {
            inner: Mutex::new(MockComments {
                next_id: 1,
                signed_in: true,
                ..MockComments::default()
            }),
            list_calls: AtomicUsize::new(0),
        }
    }
}

impl MockCommentService {
    /// Seeds `count` comments on a listing. The first seeded comment is the newest.
    pub fn with_comments(listing_id: i64, count: usize) -> Self {
        let service = Self::default();
        {
            let mut inner = service.inner.lock();
            let base = Utc::now();
            for idx in 0..count {
                let id = inner.next_id;
                inner.next_id += 1;
                let comment = api::Comment {
                    id,
                    content: format!("comment #{id}"),
                    user: api::Author {
                        id: Some(idx as i64 % 3 + 1),
                        username: format!("user{}", idx % 3 + 1),
                    },
                    created_at: base - Duration::minutes(idx as i64),
                    updated_at: None,
                    edited: false,
                    deleted: false,
                    likes_count: 0,
                    is_owner: idx % 3 == 0,
                };
                inner.comments.entry(listing_id).or_default().push(comment);
            }
        }
        service
    }

    pub fn ban_word(&self, id: i64, pattern: &str, description: &str) {
        self.inner.lock().banned.push(BannedWord {
            id,
            pattern: pattern.to_lowercase(),
            description: description.to_string(),
        });
    }

    /// Simulates likes from other viewers that this client has not seen yet.
    pub fn set_likes(&self, comment_id: i64, likes: u64) {
        let mut inner = self.inner.lock();
        if let Some(comment) = find_mut(&mut inner.comments, comment_id) {
            comment.likes_count = likes;
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    pub fn set_signed_in(&self, signed_in: bool) {
        self.inner.lock().signed_in = signed_in;
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn comment(&self, comment_id: i64) -> Option<api::Comment> {
        let mut inner = self.inner.lock();
        find_mut(&mut inner.comments, comment_id).cloned()
    }

    fn check_available(inner: &MockComments) -> ApiResult<()> {
        if inner.offline {
            return Err(ApiError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: r#"{"detail": "Service unavailable."}"#.into(),
            });
        }
        Ok(())
    }

    fn check_signed_in(inner: &MockComments) -> ApiResult<()> {
        Self::check_available(inner)?;
        if !inner.signed_in {
            return Err(ApiError::Unauthorized);
        }
        Ok(())
    }

    fn moderate(inner: &MockComments, content: &str) -> ApiResult<String> {
        let text = content.trim();
        if text.is_empty() {
            return Err(ApiError::Status {
                status: StatusCode::BAD_REQUEST,
                body: r#"{"content": ["This field may not be blank."]}"#.into(),
            });
        }
        let lowered = text.to_lowercase();
        let violations = inner
            .banned
            .iter()
            .filter(|word| lowered.contains(&word.pattern))
            .map(|word| api::Violation {
                id: word.id,
                description: word.description.clone(),
            })
            .collect::<Vec<_>>();
        if violations.is_empty() {
            Ok(text.to_string())
        } else {
            Err(ApiError::Rejected(violations))
        }
    }
}

fn find_mut(
    comments: &mut HashMap<i64, Vec<api::Comment>>,
    comment_id: i64,
) -> Option<&mut api::Comment> {
    comments
        .values_mut()
        .flat_map(|list| list.iter_mut())
        .find(|comment| comment.id == comment_id)
}

fn not_found() -> ApiError {
    ApiError::Status {
        status: StatusCode::NOT_FOUND,
        body: r#"{"detail": "Not found."}"#.into(),
    }
}

impl CommentService for MockCommentService {
    fn list(&self, listing_id: i64, limit: usize, offset: usize) -> ApiResult<api::Page<api::Comment>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock();
        Self::check_available(&inner)?;
        let all = inner
            .comments
            .get(&listing_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let results = all.iter().skip(offset).take(limit).cloned().collect();
        Ok(api::Page {
            results,
            count: all.len(),
            limit: Some(limit),
            offset: Some(offset),
        })
    }

    fn create(&self, listing_id: i64, content: &str) -> ApiResult<api::Comment> {
        let mut inner = self.inner.lock();
        Self::check_signed_in(&inner)?;
        let content = Self::moderate(&inner, content)?;
        let id = inner.next_id;
        inner.next_id += 1;
        let comment = api::Comment {
            id,
            content,
            user: api::Author {
                id: Some(1),
                username: "me".into(),
            },
            created_at: Utc::now(),
            updated_at: None,
            edited: false,
            deleted: false,
            likes_count: 0,
            is_owner: true,
        };
        inner
            .comments
            .entry(listing_id)
            .or_default()
            .insert(0, comment.clone());
        Ok(comment)
    }

    fn update(&self, comment_id: i64, content: &str) -> ApiResult<api::Comment> {
        let mut inner = self.inner.lock();
        Self::check_signed_in(&inner)?;
        let content = Self::moderate(&inner, content)?;
        let comment = find_mut(&mut inner.comments, comment_id).ok_or_else(not_found)?;
        if !comment.is_owner || comment.deleted {
            return Err(ApiError::Forbidden);
        }
        if comment.content != content {
            comment.content = content;
            comment.edited = true;
            comment.updated_at = Some(Utc::now());
        }
        Ok(comment.clone())
    }

    fn remove(&self, comment_id: i64) -> ApiResult<()> {
        let mut inner = self.inner.lock();
        Self::check_signed_in(&inner)?;
        let comment = find_mut(&mut inner.comments, comment_id).ok_or_else(not_found)?;
        if !comment.is_owner {
            return Err(ApiError::Forbidden);
        }
        comment.deleted = true;
        comment.content = DELETED_PLACEHOLDER.to_string();
        Ok(())
    }

    fn toggle_like(&self, comment_id: i64) -> ApiResult<api::LikeToggle> {
        let mut guard = self.inner.lock();
        Self::check_signed_in(&guard)?;
        let inner = &mut *guard;
        let comment = find_mut(&mut inner.comments, comment_id).ok_or_else(not_found)?;
        let liked = if inner.likes.remove(&comment_id) {
            comment.likes_count = comment.likes_count.saturating_sub(1);
            false
        } else {
            inner.likes.insert(comment_id);
            comment.likes_count += 1;
            true
        };
        Ok(api::LikeToggle {
            liked: Some(liked),
            likes_count: comment.likes_count,
        })
    }
}

/// Accepts any password of six or more characters; tokens are opaque strings.
#[derive(Default)]
pub struct MockAuthService {
    users: Mutex<HashMap<String, (api::User, String)>>,
    signed_in: Mutex<Option<api::User>>,
}

impl MockAuthService {
    fn issue(user: &api::User) -> api::AuthResponse {
        api::AuthResponse {
            user: user.clone(),
            token: format!("mock-token-{}", user.id),
        }
    }

    pub fn sign_out_remotely(&self) {
        *self.signed_in.lock() = None;
    }
}

impl AuthService for MockAuthService {
    fn login(&self, username: &str, password: &str) -> ApiResult<api::AuthResponse> {
        let users = self.users.lock();
        match users.get(username) {
            Some((user, stored)) if stored == password => {
                *self.signed_in.lock() = Some(user.clone());
                Ok(Self::issue(user))
            }
            _ => Err(ApiError::Status {
                status: StatusCode::BAD_REQUEST,
                body: r#"{"password": ["Invalid credentials."]}"#.into(),
            }),
        }
    }

    fn register(&self, username: &str, password: &str) -> ApiResult<api::AuthResponse> {
        let mut users = self.users.lock();
        if users.contains_key(username) {
            return Err(ApiError::Status {
                status: StatusCode::BAD_REQUEST,
                body: r#"{"username": ["Username is already taken."]}"#.into(),
            });
        }
        if password.len() < 6 {
            return Err(ApiError::Status {
                status: StatusCode::BAD_REQUEST,
                body: r#"{"password": ["Ensure this field has at least 6 characters."]}"#.into(),
            });
        }
        let user = api::User {
            id: users.len() as i64 + 1,
            username: username.to_string(),
            date_joined: Some(Utc::now()),
        };
        users.insert(username.to_string(), (user.clone(), password.to_string()));
        *self.signed_in.lock() = Some(user.clone());
        Ok(Self::issue(&user))
    }

    fn me(&self) -> ApiResult<api::User> {
        self.signed_in.lock().clone().ok_or(ApiError::Unauthorized)
    }
}
