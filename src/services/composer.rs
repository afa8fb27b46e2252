use serde::{Deserialize, Serialize};

/// Categories of domain activity that produce notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCategory {
    Project,
    Section,
    Staff,
    Material,
    Labor,
    Payment,
    Booking,
    General,
}

impl ActivityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityCategory::Project => "project",
            ActivityCategory::Section => "section",
            ActivityCategory::Staff => "staff",
            ActivityCategory::Material => "material",
            ActivityCategory::Labor => "labor",
            ActivityCategory::Payment => "payment",
            ActivityCategory::Booking => "booking",
            ActivityCategory::General => "general",
        }
    }
}

/// A plain domain activity record (staff assigned, project completed, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub category: ActivityCategory,
    /// Who performed the action.
    pub actor_name: String,
    /// Past-tense verb phrase, e.g. "completed" or "was assigned to".
    pub action: String,
    /// What the action was performed on.
    pub target_name: String,
    pub project_name: Option<String>,
    /// Optional free-text note appended to the body on its own line.
    pub message: Option<String>,
}

/// A material usage record; carries quantity and unit alongside the names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialActivityRecord {
    pub actor_name: String,
    pub material_name: String,
    pub quantity: f64,
    pub unit: String,
    pub project_name: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    Activity(ActivityRecord),
    MaterialActivity(MaterialActivityRecord),
}

/// Composed, ready-to-send notification content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

fn title_for(category: ActivityCategory) -> (&'static str, &'static str) {
    // (title, icon) per category.
    match category {
        ActivityCategory::Project => ("Project Update", "briefcase"),
        ActivityCategory::Section => ("Section Update", "layers"),
        ActivityCategory::Staff => ("Staff Update", "users"),
        ActivityCategory::Material => ("Material Usage", "package"),
        ActivityCategory::Labor => ("Labor Update", "hard-hat"),
        ActivityCategory::Payment => ("Payment Update", "credit-card"),
        ActivityCategory::Booking => ("Booking Update", "calendar"),
        ActivityCategory::General => ("Notification", "bell"),
    }
}

/// Build title, body and data payload for a domain event.
///
/// Pure function with no I/O so it can be exercised with literal fixtures.
pub fn compose(event: &DomainEvent) -> NotificationContent {
    match event {
        DomainEvent::Activity(record) => {
            let (title, icon) = title_for(record.category);

            let mut body = format!(
                "{} {} {}",
                record.actor_name, record.action, record.target_name
            );
            if let Some(ref project) = record.project_name {
                body.push_str(&format!(" on {}", project));
            }
            if let Some(ref message) = record.message {
                if !message.is_empty() {
                    body.push('\n');
                    body.push_str(message);
                }
            }

            NotificationContent {
                title: title.to_string(),
                body,
                data: serde_json::json!({
                    "category": record.category.as_str(),
                    "icon": icon,
                    "actor": record.actor_name,
                    "target": record.target_name,
                    "project": record.project_name,
                }),
            }
        }
        DomainEvent::MaterialActivity(record) => {
            let (title, icon) = title_for(ActivityCategory::Material);

            let mut body = format!(
                "{} used {} {} of {}",
                record.actor_name, record.quantity, record.unit, record.material_name
            );
            if let Some(ref project) = record.project_name {
                body.push_str(&format!(" on {}", project));
            }
            if let Some(ref message) = record.message {
                if !message.is_empty() {
                    body.push('\n');
                    body.push_str(message);
                }
            }

            NotificationContent {
                title: title.to_string(),
                body,
                data: serde_json::json!({
                    "category": ActivityCategory::Material.as_str(),
                    "icon": icon,
                    "actor": record.actor_name,
                    "material": record.material_name,
                    "quantity": record.quantity,
                    "unit": record.unit,
                    "project": record.project_name,
                }),
            }
        }
    }
}
