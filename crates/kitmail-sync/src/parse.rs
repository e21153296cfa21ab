//! Best-effort RFC 822 extraction. Full MIME correctness is out of scope;
//! a message that cannot yield sender and date is dropped from its batch.

use chrono::{DateTime, TimeZone, Utc};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail, addrparse, dateparse};

use kitmail_core::{Attachment, IncomingMessage};

use crate::{RawMessage, SyncError};

pub fn parse_incoming(raw: &RawMessage) -> Result<IncomingMessage, SyncError> {
    let mail = mailparse::parse_mail(&raw.raw).map_err(|e| SyncError::Parse(e.to_string()))?;

    let from_header = mail
        .headers
        .get_first_value("From")
        .ok_or_else(|| SyncError::Parse("missing From header".to_string()))?;
    let (from_address, from_display_name) = split_address(&from_header)?;

    let to_addresses = mail
        .headers
        .get_first_value("To")
        .map(|raw| address_list(&raw))
        .unwrap_or_default();

    let subject = mail.headers.get_first_value("Subject").unwrap_or_default();

    let date_header = mail
        .headers
        .get_first_value("Date")
        .ok_or_else(|| SyncError::Parse("missing Date header".to_string()))?;
    let sent_at = parse_date(&date_header)?;

    let size_bytes = if raw.size_bytes > 0 {
        raw.size_bytes
    } else {
        raw.raw.len() as u64
    };

    Ok(IncomingMessage {
        remote_id: raw.remote_id.clone(),
        from_address,
        from_display_name,
        to_addresses,
        subject,
        sent_at,
        size_bytes,
        body: best_effort_body(&mail),
        attachments: extract_attachments(&mail),
        read: raw.read,
    })
}

fn parse_date(raw: &str) -> Result<DateTime<Utc>, SyncError> {
    let epoch = dateparse(raw).map_err(|e| SyncError::Parse(format!("bad Date header: {}", e)))?;
    Utc.timestamp_opt(epoch, 0)
        .single()
        .ok_or_else(|| SyncError::Parse(format!("Date out of range: {}", raw)))
}

/// Sender address plus display name; the first single address wins.
fn split_address(raw: &str) -> Result<(String, String), SyncError> {
    let parsed = addrparse(raw).map_err(|e| SyncError::Parse(e.to_string()))?;
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(info) => {
                return Ok((
                    info.addr.clone(),
                    info.display_name.clone().unwrap_or_default(),
                ));
            }
            MailAddr::Group(group) => {
                if let Some(info) = group.addrs.first() {
                    return Ok((
                        info.addr.clone(),
                        info.display_name.clone().unwrap_or_default(),
                    ));
                }
            }
        }
    }
    Err(SyncError::Parse(format!("no address in {:?}", raw)))
}

fn address_list(raw: &str) -> Vec<String> {
    let Ok(parsed) = addrparse(raw) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(info) => out.push(info.addr.clone()),
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    out.push(info.addr.clone());
                }
            }
        }
    }
    out
}

/// Prefers the first text/plain part anywhere in the tree, then any text
/// part, then gives up with an empty body.
fn best_effort_body(mail: &ParsedMail) -> String {
    if let Some(body) = find_body(mail, "text/plain") {
        return body;
    }
    find_body(mail, "text/").unwrap_or_default()
}

fn find_body(part: &ParsedMail, mime_prefix: &str) -> Option<String> {
    if part.subparts.is_empty() {
        if part.ctype.mimetype.starts_with(mime_prefix)
            && part.get_content_disposition().disposition != DispositionType::Attachment
        {
            return part.get_body().ok();
        }
        return None;
    }
    part.subparts
        .iter()
        .find_map(|sub| find_body(sub, mime_prefix))
}

fn extract_attachments(mail: &ParsedMail) -> Vec<Attachment> {
    let mut out = Vec::new();
    collect_attachments(mail, &mut out);
    out
}

fn collect_attachments(part: &ParsedMail, out: &mut Vec<Attachment>) {
    for sub in &part.subparts {
        let disposition = sub.get_content_disposition();
        let filename = disposition.params.get("filename").cloned();
        if disposition.disposition == DispositionType::Attachment || filename.is_some() {
            let size_bytes = sub.get_body_raw().map(|b| b.len() as u64).unwrap_or(0);
            out.push(Attachment {
                filename: filename.unwrap_or_else(|| "(unnamed)".to_string()),
                mime: sub.ctype.mimetype.clone(),
                size_bytes,
            });
            continue;
        }
        collect_attachments(sub, out);
    }
}
