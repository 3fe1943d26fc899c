//! Recognition attempt log.
//!
//! Every recognition request writes one row per reported face, all sharing a
//! `request_id`. A request that found no faces still writes a single row with
//! no identity so the attempt is visible.

use crate::gallery::SqliteGallery;
use crate::StoreError;
use chrono::{DateTime, SecondsFormat, Utc};
use facematch_core::MatchResult;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_LOG_LIMIT: usize = 50;

/// Where the probe image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionMethod {
    Camera,
    Upload,
}

impl RecognitionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionMethod::Camera => "camera",
            RecognitionMethod::Upload => "upload",
        }
    }
}

impl fmt::Display for RecognitionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecognitionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "camera" => Ok(RecognitionMethod::Camera),
            "upload" => Ok(RecognitionMethod::Upload),
            other => Err(format!("unknown recognition method: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionLog {
    pub id: String,
    pub request_id: String,
    pub method: RecognitionMethod,
    /// `None` when the request found no faces.
    pub identity: Option<String>,
    pub confidence: Option<f32>,
    pub faces_detected: usize,
    pub timestamp: DateTime<Utc>,
}

impl SqliteGallery {
    /// Record the outcome of one recognition request. Returns its request id.
    pub fn log_recognition(
        &self,
        method: RecognitionMethod,
        results: &[MatchResult],
    ) -> Result<String, StoreError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let faces = results.len() as i64;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO recognition_logs (id, request_id, method, identity, confidence, faces_detected, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;

            if results.is_empty() {
                stmt.execute(params![
                    uuid::Uuid::new_v4().to_string(),
                    request_id,
                    method.as_str(),
                    None::<String>,
                    None::<f64>,
                    0i64,
                    timestamp,
                ])?;
            }

            for result in results {
                stmt.execute(params![
                    uuid::Uuid::new_v4().to_string(),
                    request_id,
                    method.as_str(),
                    result.identity.as_str(),
                    result.confidence as f64,
                    faces,
                    timestamp,
                ])?;
            }
        }
        tx.commit()?;

        tracing::debug!(request_id = %request_id, %method, faces, "recognition logged");
        Ok(request_id)
    }

    /// Most recent log rows, newest first. Malformed rows are skipped.
    pub fn recent_logs(&self, limit: usize) -> Result<Vec<RecognitionLog>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, request_id, method, identity, confidence, faces_detected, timestamp
             FROM recognition_logs
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut logs = Vec::with_capacity(rows.len());
        for (id, request_id, method, identity, confidence, faces, timestamp) in rows {
            let method = match method.parse::<RecognitionMethod>() {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "skipping malformed log row");
                    continue;
                }
            };
            let timestamp = match DateTime::parse_from_rfc3339(&timestamp) {
                Ok(t) => t.with_timezone(&Utc),
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "skipping malformed log row");
                    continue;
                }
            };
            logs.push(RecognitionLog {
                id,
                request_id,
                method,
                identity,
                confidence: confidence.map(|c| c as f32),
                faces_detected: faces.max(0) as usize,
                timestamp,
            });
        }
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facematch_core::{BoundingBox, Identity};

    fn result(identity: Identity, confidence: f32) -> MatchResult {
        MatchResult {
            identity,
            confidence,
            bbox: BoundingBox::new(0, 0, 10, 10).unwrap(),
            detection_confidence: 0.95,
            matched_entry_id: None,
        }
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("camera".parse::<RecognitionMethod>().unwrap(), RecognitionMethod::Camera);
        assert_eq!("Upload".parse::<RecognitionMethod>().unwrap(), RecognitionMethod::Upload);
        assert!("webcam".parse::<RecognitionMethod>().is_err());
        assert_eq!(RecognitionMethod::Upload.to_string(), "upload");
    }

    #[test]
    fn test_log_one_row_per_face() {
        let store = SqliteGallery::open_in_memory().unwrap();
        let results = vec![
            result(Identity::Known("Alice".into()), 0.82),
            result(Identity::Unknown, 0.95),
        ];
        let request_id = store.log_recognition(RecognitionMethod::Upload, &results).unwrap();

        let logs = store.recent_logs(DEFAULT_LOG_LIMIT).unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.request_id == request_id));
        assert!(logs.iter().all(|l| l.faces_detected == 2));
        assert!(logs.iter().all(|l| l.method == RecognitionMethod::Upload));

        let mut identities: Vec<_> = logs.iter().filter_map(|l| l.identity.clone()).collect();
        identities.sort();
        assert_eq!(identities, vec!["Alice".to_string(), "Unknown".to_string()]);
    }

    #[test]
    fn test_log_no_faces_writes_placeholder() {
        let store = SqliteGallery::open_in_memory().unwrap();
        store.log_recognition(RecognitionMethod::Camera, &[]).unwrap();

        let logs = store.recent_logs(10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].identity, None);
        assert_eq!(logs[0].confidence, None);
        assert_eq!(logs[0].faces_detected, 0);
    }

    #[test]
    fn test_recent_logs_newest_first_and_limited() {
        let store = SqliteGallery::open_in_memory().unwrap();
        for name in ["A", "B", "C"] {
            store
                .log_recognition(RecognitionMethod::Upload, &[result(Identity::Known(name.into()), 0.9)])
                .unwrap();
        }

        let logs = store.recent_logs(2).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].identity.as_deref(), Some("C"));
        assert_eq!(logs[1].identity.as_deref(), Some("B"));
    }

    #[test]
    fn test_malformed_log_row_skipped() {
        let store = SqliteGallery::open_in_memory().unwrap();
        store.log_recognition(RecognitionMethod::Camera, &[]).unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO recognition_logs (id, request_id, method, faces_detected, timestamp)
                 VALUES ('x', 'r', 'carrier-pigeon', 0, '2999-01-01T00:00:00Z')",
                [],
            )
            .unwrap();

        let logs = store.recent_logs(10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].method, RecognitionMethod::Camera);
    }
}
