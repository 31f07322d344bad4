//! Minimal scenario fixtures: a run, a file, a POI pair, and a relationship
//! between them, with sane defaults every field an individual scenario
//! test doesn't care about.

use ctp_db::types::{NewPoi, NewRelationship, PoiRow, RelationshipRow};
use ctp_errors::Result;
use sqlx::PgPool;
use uuid::Uuid;

/// Inserts a run plus one file row, returning `(run_id, file_id)`.
pub async fn seed_run_and_file(pool: &PgPool, config_hash: &str, file_path: &str) -> Result<(Uuid, i64)> {
    let run_id = Uuid::new_v4();
    ctp_db::runs::insert_run(pool, run_id, config_hash).await?;
    let file_id = ctp_db::files::upsert_file(pool, run_id, file_path).await?;
    Ok((run_id, file_id))
}

/// A POI fixture with every optional field defaulted; override what the
/// scenario under test cares about via the returned builder-ish struct.
pub struct PoiFixture {
    pub run_id: Uuid,
    pub file_id: i64,
    pub file_path: String,
    pub name: String,
    pub poi_type: String,
    pub start_line: i32,
    pub end_line: i32,
    pub is_exported: bool,
}

impl PoiFixture {
    pub fn new(run_id: Uuid, file_id: i64, file_path: &str, name: &str) -> Self {
        Self {
            run_id,
            file_id,
            file_path: file_path.to_string(),
            name: name.to_string(),
            poi_type: "function".to_string(),
            start_line: 1,
            end_line: 1,
            is_exported: true,
        }
    }

    pub async fn insert(self, pool: &PgPool) -> Result<PoiRow> {
        let semantic_id = format!("{}::{}", self.file_path, self.name);
        let hash = format!("hash::{semantic_id}");
        ctp_db::pois::insert_poi(
            pool,
            &NewPoi {
                run_id: self.run_id,
                file_id: self.file_id,
                file_path: self.file_path,
                name: self.name,
                poi_type: self.poi_type,
                start_line: self.start_line,
                end_line: self.end_line,
                description: None,
                is_exported: self.is_exported,
                semantic_id,
                hash,
            },
        )
        .await
    }
}

/// Inserts a `PENDING` relationship between two already-inserted POIs.
pub async fn seed_pending_relationship(
    pool: &PgPool,
    run_id: Uuid,
    source: &PoiRow,
    target: &PoiRow,
    relationship_type: &str,
    confidence: f64,
) -> Result<RelationshipRow> {
    let relationship_hash = format!("{}->{}:{relationship_type}", source.semantic_id, target.semantic_id);
    ctp_db::relationships::insert_pending(
        pool,
        &NewRelationship {
            run_id,
            source_poi_id: source.id,
            target_poi_id: target.id,
            relationship_type: relationship_type.to_string(),
            file_path: Some(source.file_path.clone()),
            confidence,
            evidence: None,
            reason: None,
            relationship_hash,
        },
    )
    .await
}
