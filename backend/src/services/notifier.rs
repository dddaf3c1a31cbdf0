//! Notification boundary.
//!
//! The engine decides what an instructor is told and when; actually getting
//! the message to them (mail, SMS) is the job of a [`NotificationTransport`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::models::{Assignment, Contact, Instructor, TrainingLocation, Unit};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The recipient or message was refused; retrying will not help.
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error("transport unreachable: {0}")]
    Unreachable(String),
    #[error("transport timed out")]
    Timeout,
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }
}

/// Rendered assignment notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub subject: String,
    pub lines: Vec<String>,
}

impl NotificationMessage {
    pub fn body(&self) -> String {
        self.lines.join("\n")
    }

    /// Describe `assignment` to the instructor who holds it.
    pub fn for_assignment(
        assignment: &Assignment,
        unit: &Unit,
        locations: &[TrainingLocation],
        instructor: &Instructor,
    ) -> Self {
        let mut lines = vec![
            format!("Hello {},", instructor.name),
            format!(
                "You have been assigned to {} on {} as {}.",
                unit.name, assignment.date, assignment.role
            ),
            format!("Unit address: {}", unit.place.address),
        ];
        for location in locations {
            lines.push(format!(
                "Training location: {} ({} instructors)",
                location.place.address, location.instructors_required
            ));
        }
        if let Some(hours) = unit.work_hours {
            lines.push(format!("Working hours: {}", hours));
        }
        if let Some(lunch) = unit.lunch_hours {
            lines.push(format!("Lunch: {}", lunch));
        }
        if let Some(officer) = &unit.officer {
            let reach = [officer.phone.as_deref(), officer.email.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(", ");
            if reach.is_empty() {
                lines.push(format!("Contact officer: {}", officer.name));
            } else {
                lines.push(format!("Contact officer: {} ({})", officer.name, reach));
            }
        }
        lines.push("Please accept or reject this assignment.".to_string());

        Self {
            subject: format!("Training assignment: {} on {}", unit.name, assignment.date),
            lines,
        }
    }
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(
        &self,
        contact: &Contact,
        message: &NotificationMessage,
    ) -> Result<(), TransportError>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn send(
        &self,
        contact: &Contact,
        message: &NotificationMessage,
    ) -> Result<(), TransportError> {
        let recipient = contact
            .email
            .as_deref()
            .or(contact.phone.as_deref())
            .ok_or_else(|| TransportError::Rejected("no email or phone on file".into()))?;
        info!(%recipient, subject = %message.subject, "notification sent");
        Ok(())
    }
}
