use chrono::{DateTime, Local, Utc};
use textwrap::{wrap, Options as WrapOptions};

use crate::api::{self, Comment, Listing, ListingSummary, Violation};
use crate::feed::{FeedError, FeedState};

pub const DEFAULT_WIDTH: usize = 80;

const LIKE_ICON: &str = "❤";
const VIEWS_ICON: &str = "👁";

fn wrap_with_prefixes(text: &str, width: usize, first_prefix: &str, rest_prefix: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return vec![first_prefix.trim_end().to_string()];
    }
    if width == 0 {
        return vec![format!("{first_prefix}{text}")];
    }

    let min_width = first_prefix
        .chars()
        .count()
        .max(rest_prefix.chars().count())
        .saturating_add(1);
    let options = WrapOptions::new(width.max(min_width))
        .break_words(false)
        .initial_indent(first_prefix)
        .subsequent_indent(rest_prefix);

    wrap(text, options)
        .into_iter()
        .map(|cow| cow.into_owned())
        .collect()
}

fn wrap_with_prefix(text: &str, width: usize, prefix: &str) -> Vec<String> {
    wrap_with_prefixes(text, width, prefix, prefix)
}

pub fn price_label(price: Option<&str>) -> Option<String> {
    price
        .map(str::trim)
        .filter(|price| !price.is_empty())
        .map(|price| format!("{price} ₽"))
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%d.%m.%Y %H:%M").to_string()
}

pub fn listing_row(listing: &ListingSummary) -> String {
    let price = price_label(listing.price.as_deref()).unwrap_or_else(|| "—".to_string());
    format!(
        "#{:<6} {}  ·  {}  ·  {VIEWS_ICON} {}",
        listing.id, listing.title, price, listing.view_count
    )
}

pub fn listing_lines(listings: &[ListingSummary]) -> Vec<String> {
    if listings.is_empty() {
        return vec!["Популярных объявлений пока нет.".to_string()];
    }
    listings.iter().map(listing_row).collect()
}

pub fn listing_detail(listing: &Listing, width: usize) -> Vec<String> {
    let mut lines = wrap_with_prefix(&listing.title, width, "");
    lines.push(
        price_label(listing.price.as_deref()).unwrap_or_else(|| "Цена не указана".to_string()),
    );
    lines.push(format!(
        "#{}  ·  {VIEWS_ICON} {}  ·  {}",
        listing.id, listing.view_count, listing.avito_url
    ));
    lines.push(String::new());

    let description = listing.description.trim();
    if description.is_empty() {
        lines.push("Описание отсутствует.".to_string());
    } else {
        for raw_line in description.lines() {
            if raw_line.trim().is_empty() {
                lines.push(String::new());
                continue;
            }
            lines.extend(wrap_with_prefix(raw_line.trim(), width, ""));
        }
    }
    lines
}

pub fn violation_lines(violations: &[Violation], indent: &str) -> Vec<String> {
    if violations.is_empty() {
        return Vec::new();
    }
    let mut lines = vec![format!("{indent}Обнаружены запрещённые слова:")];
    lines.extend(
        violations
            .iter()
            .map(|violation| format!("{indent}  • {}", violation.description)),
    );
    lines
}

pub fn comment_lines(comment: &Comment, width: usize, signed_in: bool) -> Vec<String> {
    let mut header = format!(
        "[{}] {} · {}",
        comment.id,
        comment.user.username,
        format_timestamp(comment.created_at)
    );
    if comment.edited {
        header.push_str(" · редактировано");
    }
    header.push_str(&format!(" · {LIKE_ICON} {}", comment.likes_count));

    let mut lines = wrap_with_prefixes(&header, width, "", "  ");

    let body = if comment.deleted {
        crate::data::DELETED_PLACEHOLDER
    } else {
        comment.content.as_str()
    };
    for raw_line in body.lines() {
        if raw_line.trim().is_empty() {
            lines.push(String::new());
            continue;
        }
        lines.extend(wrap_with_prefix(raw_line.trim(), width, "    "));
    }

    if signed_in && comment.can_modify() {
        lines.push(format!(
            "    (ваш комментарий: edit / delete {})",
            comment.id
        ));
    }
    lines
}

fn error_line(error: &FeedError) -> String {
    match error {
        FeedError::FetchFailed(message) => format!("Ошибка запроса: {message}"),
        FeedError::ValidationRejected(_) => "Комментарий отклонён модерацией.".to_string(),
        FeedError::Unauthenticated => "Сессия истекла, войдите снова.".to_string(),
    }
}

/// Full comments section of a listing page.
pub fn feed_lines(state: &FeedState, viewer: Option<&api::User>, width: usize) -> Vec<String> {
    let mut lines = vec![format!("Комментарии ({})", state.total)];

    match viewer {
        Some(user) => lines.push(format!("Вы вошли как {}.", user.username)),
        None => lines.push("Войдите, чтобы оставлять комментарии.".to_string()),
    }
    lines.extend(violation_lines(&state.violations, ""));
    if let Some(error) = &state.error {
        lines.push(error_line(error));
    }
    lines.push(String::new());

    if state.comments.is_empty() {
        if state.loaded {
            lines.push("Будьте первым, кто оставит комментарий.".to_string());
        }
        return lines;
    }

    for comment in &state.comments {
        lines.extend(comment_lines(comment, width, viewer.is_some()));
        if let Some(edit) = state.edit.as_ref().filter(|edit| edit.comment_id == comment.id) {
            lines.extend(violation_lines(&edit.violations, "    "));
        }
        lines.push(String::new());
    }

    if state.can_load_more() {
        let remaining = state.total.saturating_sub(state.comments.len());
        lines.push(format!(
            "Показано {} из {}, ещё {remaining} (--pages)",
            state.comments.len(),
            state.total
        ));
    }
    lines
}
