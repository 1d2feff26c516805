//! Merged, time-ordered view of a bug's comments, attachments and history.
//!
//! Entries sharing an exact timestamp are combined into one record (an
//! attachment posted together with its describing comment, for instance).
//! Within a record, items come out comment first, then attachments, then
//! history changes; same-kind ties keep their input order.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::types::{AttachmentMeta, Comment, HistoryEntry};

/// How an entry should initially be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rendering {
  /// At or after the last visit: render fully right away
  Full,
  /// Seen before: render collapsed until expanded
  Collapsed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
  pub time: DateTime<Utc>,
  pub comments: Vec<Comment>,
  pub attachments: Vec<AttachmentMeta>,
  pub history: Vec<HistoryEntry>,
  pub rendering: Rendering,
}

/// One fact inside a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimelineItem<'a> {
  Comment(&'a Comment),
  Attachment(&'a AttachmentMeta),
  History(&'a HistoryEntry),
}

impl TimelineEntry {
  fn new(time: DateTime<Utc>) -> Self {
    Self {
      time,
      comments: Vec::new(),
      attachments: Vec::new(),
      history: Vec::new(),
      rendering: Rendering::Full,
    }
  }

  pub fn items(&self) -> impl Iterator<Item = TimelineItem<'_>> {
    self
      .comments
      .iter()
      .map(TimelineItem::Comment)
      .chain(self.attachments.iter().map(TimelineItem::Attachment))
      .chain(self.history.iter().map(TimelineItem::History))
  }

  pub fn is_collapsed(&self) -> bool {
    self.rendering == Rendering::Collapsed
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
  entries: Vec<TimelineEntry>,
}

impl Timeline {
  /// Merge everything eagerly; only the rendering hint depends on `last_visit`.
  pub fn build(
    comments: Vec<Comment>,
    attachments: Vec<AttachmentMeta>,
    history: Vec<HistoryEntry>,
    last_visit: Option<DateTime<Utc>>,
  ) -> Self {
    let mut by_time: BTreeMap<DateTime<Utc>, TimelineEntry> = BTreeMap::new();

    for comment in comments {
      by_time
        .entry(comment.creation_time)
        .or_insert_with(|| TimelineEntry::new(comment.creation_time))
        .comments
        .push(comment);
    }
    for attachment in attachments {
      by_time
        .entry(attachment.creation_time)
        .or_insert_with(|| TimelineEntry::new(attachment.creation_time))
        .attachments
        .push(attachment);
    }
    for change in history {
      by_time
        .entry(change.when)
        .or_insert_with(|| TimelineEntry::new(change.when))
        .history
        .push(change);
    }

    let entries = by_time
      .into_values()
      .map(|mut entry| {
        entry.rendering = match last_visit {
          Some(visit) if entry.time < visit => Rendering::Collapsed,
          _ => Rendering::Full,
        };
        entry
      })
      .collect();

    Self { entries }
  }

  pub fn entries(&self) -> &[TimelineEntry] {
    &self.entries
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Every fact in order, flattened across entries.
  pub fn items(&self) -> impl Iterator<Item = TimelineItem<'_>> {
    self.entries.iter().flat_map(TimelineEntry::items)
  }

  pub fn collapsed_count(&self) -> usize {
    self.entries.iter().filter(|e| e.is_collapsed()).count()
  }

  pub fn expand_all(&mut self) {
    for entry in &mut self.entries {
      entry.rendering = Rendering::Full;
    }
  }
}
