use crate::models::{ElectionResult, ElectionStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElectionUpdate {
    CandidateAdded {
        business_id: String,
        name: String,
        nominator_nickname: String,
    },
    StatusChanged {
        status: ElectionStatus,
    },
    ResultsUpdated(ElectionResult),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionUpdateEvent {
    pub id: String,
    pub update: ElectionUpdate,
}

impl ElectionUpdateEvent {
    pub fn candidate_added(business_id: &str, name: &str, nominator_nickname: &str) -> Self {
        let update = ElectionUpdate::CandidateAdded {
            business_id: business_id.to_string(),
            name: name.to_string(),
            nominator_nickname: nominator_nickname.to_string(),
        };
        Self {
            id: format!("{}-{}", update.event_type(), business_id),
            update,
        }
    }

    pub fn status_changed(status: ElectionStatus) -> Self {
        let update = ElectionUpdate::StatusChanged { status };
        Self {
            id: format!("{}-{}", update.event_type(), status),
            update,
        }
    }

    pub fn results_updated(result: ElectionResult) -> Self {
        let id = format!("RESULTS_UPDATED-{}", result.calculated_at.timestamp_millis());
        Self {
            id,
            update: ElectionUpdate::ResultsUpdated(result),
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.update.event_type()
    }

    /// Renders the event as a server-sent-events frame.
    pub fn to_sse_frame(&self) -> Result<String, serde_json::Error> {
        let mut tagged = serde_json::to_value(&self.update)?;
        let data = tagged.get_mut("data").map(Value::take).unwrap_or(Value::Null);
        Ok(format!(
            "id: {}\nevent: {}\ndata: {}\n\n",
            self.id,
            self.event_type(),
            serde_json::to_string(&data)?
        ))
    }
}

impl ElectionUpdate {
    pub fn event_type(&self) -> &'static str {
        match self {
            ElectionUpdate::CandidateAdded { .. } => "CANDIDATE_ADDED",
            ElectionUpdate::StatusChanged { .. } => "STATUS_CHANGED",
            ElectionUpdate::ResultsUpdated(_) => "RESULTS_UPDATED",
        }
    }
}
