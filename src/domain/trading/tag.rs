//! Broker order tags.
//!
//! Every order the engine places carries a deterministic tag derived from
//! `(trade_id, role)`. Tags survive into the broker's order book, so after a
//! retryable place error we can scan recent orders by tag instead of blindly
//! re-submitting. Broker limit: 20 characters.

use crate::domain::trading::types::OrderRole;

pub const MAX_TAG_LEN: usize = 20;

/// `T` + first 18 chars of the hyphen-stripped trade id + role code.
pub fn order_tag(trade_id: &str, role: OrderRole) -> String {
    let compact: String = trade_id.chars().filter(|c| *c != '-').take(18).collect();
    let mut tag = String::with_capacity(MAX_TAG_LEN);
    tag.push('T');
    tag.push_str(&compact);
    tag.push(role.code());
    debug_assert!(tag.len() <= MAX_TAG_LEN);
    tag
}

/// Reverse lookup on postbacks that lost their order link: does this tag
/// belong to the given trade, and if so in which role?
pub fn parse_role(tag: &str, trade_id: &str) -> Option<OrderRole> {
    let expected_body: String = trade_id.chars().filter(|c| *c != '-').take(18).collect();
    let rest = tag.strip_prefix('T')?;
    let body = rest.get(..rest.len().checked_sub(1)?)?;
    if body != expected_body {
        return None;
    }
    match rest.chars().last()? {
        'E' => Some(OrderRole::Entry),
        'S' => Some(OrderRole::Sl),
        'T' => Some(OrderRole::Target),
        'P' => Some(OrderRole::PanicExit),
        '1' => Some(OrderRole::Tp1),
        'Q' => Some(OrderRole::BrokerSquareoff),
        _ => None,
    }
}
