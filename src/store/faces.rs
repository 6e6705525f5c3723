//! Face detections and person identities.

use anyhow::Result;
use rusqlite::params;

use super::vectors::{bytes_to_vector, vector_to_bytes};
use super::VectorStore;

/// Bounding box for a detected face, in detector input space (416x416).
/// Scale with [`BoundingBox::scaled`] before any geometric use against the
/// original image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    /// Map this box from `from`-sized detector space onto an image of
    /// `to_width` x `to_height` pixels.
    pub fn scaled(&self, from: u32, to_width: u32, to_height: u32) -> BoundingBox {
        let sx = to_width as f32 / from as f32;
        let sy = to_height as f32 / from as f32;
        BoundingBox {
            x: (self.x as f32 * sx) as i32,
            y: (self.y as f32 * sy) as i32,
            width: ((self.width as f32 * sx) as i32).max(1),
            height: ((self.height as f32 * sy) as i32).max(1),
        }
    }
}

/// A stored face detection with its vector slots.
#[derive(Debug, Clone)]
pub struct FaceRecord {
    pub id: i64,
    pub photo_id: i64,
    pub bbox: BoundingBox,
    pub confidence: Option<f32>,
    /// Legacy slot of unspecified origin, kept for backward compatibility.
    pub legacy_embedding: Option<Vec<f32>>,
    /// 128-dim identity descriptor.
    pub face_embedding: Option<Vec<f32>>,
    /// 512-dim content vector of the face region.
    pub semantic_embedding: Option<Vec<f32>>,
    pub vector_version: i64,
    pub person_id: Option<i64>,
    pub is_manual: bool,
}

/// Input row for detection writes.
#[derive(Debug, Clone)]
pub struct NewDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub face_embedding: Option<Vec<f32>>,
    pub semantic_embedding: Option<Vec<f32>>,
}

/// A person (named face cluster identity).
#[derive(Debug, Clone)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub face_count: i64,
    pub is_manual: bool,
}

/// vector_version is derived from the populated slots, never passed in:
/// 0 = none, 1 = face only, 2 = face + semantic.
fn version_for(face: bool, semantic: bool) -> i64 {
    match (face, semantic) {
        (true, true) => 2,
        (true, false) => 1,
        _ => 0,
    }
}

fn row_to_face(row: &rusqlite::Row<'_>) -> rusqlite::Result<FaceRecord> {
    let legacy: Option<Vec<u8>> = row.get(6)?;
    let face: Option<Vec<u8>> = row.get(7)?;
    let semantic: Option<Vec<u8>> = row.get(8)?;
    Ok(FaceRecord {
        id: row.get(0)?,
        photo_id: row.get(1)?,
        bbox: BoundingBox {
            x: row.get(2)?,
            y: row.get(3)?,
            width: row.get(4)?,
            height: row.get(5)?,
        },
        confidence: row.get(9)?,
        legacy_embedding: legacy.map(|b| bytes_to_vector(&b)),
        face_embedding: face.map(|b| bytes_to_vector(&b)),
        semantic_embedding: semantic.map(|b| bytes_to_vector(&b)),
        vector_version: row.get(10)?,
        person_id: row.get(11)?,
        is_manual: row.get::<_, i64>(12)? != 0,
    })
}

const FACE_COLUMNS: &str = "id, photo_id, bbox_x, bbox_y, bbox_w, bbox_h, \
     embedding, face_embedding, semantic_embedding, confidence, vector_version, person_id, is_manual";

impl VectorStore {
    // ========================================================================
    // Detections
    // ========================================================================

    /// Replace all detections for a photo with a fresh set, in one
    /// transaction. Delete-then-insert, never merge: re-detection is
    /// idempotent because the photo's detections are wholesale state.
    pub fn replace_photo_detections(&self, photo_id: i64, detections: &[NewDetection]) -> Result<Vec<i64>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        // Fix up denormalized counts for persons losing faces here
        tx.execute(
            r#"
            UPDATE persons SET face_count = face_count - (
                SELECT COUNT(*) FROM detected_faces
                WHERE detected_faces.person_id = persons.id AND detected_faces.photo_id = ?
            )
            WHERE id IN (SELECT person_id FROM detected_faces WHERE photo_id = ? AND person_id IS NOT NULL)
            "#,
            params![photo_id, photo_id],
        )?;
        tx.execute("DELETE FROM detected_faces WHERE photo_id = ?", [photo_id])?;

        let mut ids = Vec::with_capacity(detections.len());
        for det in detections {
            // A semantic vector without a face descriptor is not
            // representable in vector_version; drop it
            let face = det.face_embedding.as_deref();
            let semantic = if face.is_some() {
                det.semantic_embedding.as_deref()
            } else {
                None
            };
            let version = version_for(face.is_some(), semantic.is_some());

            tx.execute(
                r#"
                INSERT INTO detected_faces
                    (photo_id, bbox_x, bbox_y, bbox_w, bbox_h, confidence,
                     face_embedding, semantic_embedding, vector_version)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    photo_id,
                    det.bbox.x,
                    det.bbox.y,
                    det.bbox.width,
                    det.bbox.height,
                    det.confidence,
                    face.map(vector_to_bytes),
                    semantic.map(vector_to_bytes),
                    version,
                ],
            )?;
            ids.push(tx.last_insert_rowid());
        }

        tx.commit()?;
        Ok(ids)
    }

    pub fn face_by_id(&self, face_id: i64) -> Result<Option<FaceRecord>> {
        let conn = self.conn();
        let result = conn.query_row(
            &format!("SELECT {FACE_COLUMNS} FROM detected_faces WHERE id = ?"),
            [face_id],
            row_to_face,
        );
        match result {
            Ok(face) => Ok(Some(face)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn faces_for_photo(&self, photo_id: i64) -> Result<Vec<FaceRecord>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {FACE_COLUMNS} FROM detected_faces WHERE photo_id = ? ORDER BY id"))?;
        let faces = stmt
            .query_map([photo_id], row_to_face)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(faces)
    }

    pub fn faces_for_person(&self, person_id: i64) -> Result<Vec<FaceRecord>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {FACE_COLUMNS} FROM detected_faces WHERE person_id = ? ORDER BY id"))?;
        let faces = stmt
            .query_map([person_id], row_to_face)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(faces)
    }

    /// Unassigned faces that carry a face vector, in arrival order.
    /// Arrival order is what makes cluster seeding deterministic.
    pub fn unassigned_faces_with_vectors(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, face_embedding FROM detected_faces \
             WHERE person_id IS NULL AND face_embedding IS NOT NULL ORDER BY id",
        )?;
        let faces = stmt
            .query_map([], |row| {
                let bytes: Vec<u8> = row.get(1)?;
                Ok((row.get(0)?, bytes_to_vector(&bytes)))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(faces)
    }

    /// All faces with face vectors (for similarity lookup).
    pub fn faces_with_vectors(&self) -> Result<Vec<(i64, i64, Option<i64>, Vec<f32>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, photo_id, person_id, face_embedding FROM detected_faces \
             WHERE face_embedding IS NOT NULL ORDER BY id",
        )?;
        let faces = stmt
            .query_map([], |row| {
                let bytes: Vec<u8> = row.get(3)?;
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, bytes_to_vector(&bytes)))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(faces)
    }

    /// Face vectors grouped under their assigned person, centroid input.
    pub fn assigned_face_vectors(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT person_id, face_embedding FROM detected_faces \
             WHERE person_id IS NOT NULL AND face_embedding IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let bytes: Vec<u8> = row.get(1)?;
                Ok((row.get(0)?, bytes_to_vector(&bytes)))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Semantic vectors for retrieval: one row per detection that has one.
    pub fn semantic_vectors(&self) -> Result<Vec<(i64, i64, Vec<f32>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, photo_id, semantic_embedding FROM detected_faces \
             WHERE semantic_embedding IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let bytes: Vec<u8> = row.get(2)?;
                Ok((row.get(0)?, row.get(1)?, bytes_to_vector(&bytes)))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Detections whose vector slots are behind the current pipeline
    /// (vector_version < 2), with the owning photo's path and dimensions.
    pub fn faces_needing_vectors(&self, limit: usize) -> Result<Vec<(FaceRecord, String, Option<i64>, Option<i64>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT f.id, f.photo_id, f.bbox_x, f.bbox_y, f.bbox_w, f.bbox_h, \
                    f.embedding, f.face_embedding, f.semantic_embedding, f.confidence, \
                    f.vector_version, f.person_id, f.is_manual, p.path, p.width, p.height \
             FROM detected_faces f JOIN photos p ON p.id = f.photo_id \
             WHERE f.vector_version < 2 ORDER BY f.id LIMIT ?",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((row_to_face(row)?, row.get(13)?, row.get(14)?, row.get(15)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Re-populate a detection's vector slots, keeping vector_version in step.
    pub fn update_face_vectors(
        &self,
        face_id: i64,
        face_embedding: Option<&[f32]>,
        semantic_embedding: Option<&[f32]>,
    ) -> Result<()> {
        let semantic = if face_embedding.is_some() { semantic_embedding } else { None };
        let version = version_for(face_embedding.is_some(), semantic.is_some());
        self.conn().execute(
            "UPDATE detected_faces SET face_embedding = ?, semantic_embedding = ?, vector_version = ? WHERE id = ?",
            params![
                face_embedding.map(vector_to_bytes),
                semantic.map(vector_to_bytes),
                version,
                face_id
            ],
        )?;
        Ok(())
    }

    pub fn mark_photo_scanned(&self, photo_id: i64, faces_found: usize) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO face_scans (photo_id, faces_found, scanned_at) VALUES (?, ?, CURRENT_TIMESTAMP)",
            params![photo_id, faces_found as i64],
        )?;
        Ok(())
    }

    pub fn count_faces(&self) -> Result<i64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM detected_faces", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_unassigned_faces(&self) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM detected_faces WHERE person_id IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Bulk reset: wipe detections, scan bookkeeping and automatic persons
    /// for a fresh re-index. Manual persons survive with zeroed counts.
    pub fn reset_detections(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            r#"
            DELETE FROM detected_faces;
            DELETE FROM face_scans;
            DELETE FROM persons WHERE is_manual = 0;
            UPDATE persons SET face_count = 0;
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Persons
    // ========================================================================

    pub fn create_person(&self, name: &str, is_manual: bool) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO persons (name, is_manual) VALUES (?, ?)",
            params![name, is_manual as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn person(&self, person_id: i64) -> Result<Option<Person>> {
        let conn = self.conn();
        let result = conn.query_row(
            "SELECT id, name, face_count, is_manual FROM persons WHERE id = ?",
            [person_id],
            |row| {
                Ok(Person {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    face_count: row.get(2)?,
                    is_manual: row.get::<_, i64>(3)? != 0,
                })
            },
        );
        match result {
            Ok(person) => Ok(Some(person)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn persons(&self) -> Result<Vec<Person>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, name, face_count, is_manual FROM persons ORDER BY name")?;
        let persons = stmt
            .query_map([], |row| {
                Ok(Person {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    face_count: row.get(2)?,
                    is_manual: row.get::<_, i64>(3)? != 0,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(persons)
    }

    pub fn rename_person(&self, person_id: i64, name: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE persons SET name = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            params![name, person_id],
        )?;
        Ok(())
    }

    pub fn delete_person(&self, person_id: i64) -> Result<()> {
        self.conn()
            .execute("DELETE FROM persons WHERE id = ?", [person_id])?;
        Ok(())
    }

    pub fn count_persons(&self) -> Result<i64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM persons", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn assign_face_to_person(&self, face_id: i64, person_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE detected_faces SET person_id = ? WHERE id = ? AND (person_id IS NULL OR person_id != ?)",
            params![person_id, face_id, person_id],
        )?;
        if changed > 0 {
            tx.execute(
                "UPDATE persons SET face_count = face_count + 1, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
                [person_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn assign_faces_to_person(&self, face_ids: &[i64], person_id: i64) -> Result<usize> {
        let mut assigned = 0;
        for &face_id in face_ids {
            self.assign_face_to_person(face_id, person_id)?;
            assigned += 1;
        }
        Ok(assigned)
    }

    /// Clear a face's person link. The detection itself is kept.
    pub fn unassign_face(&self, face_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let previous: Option<i64> = tx
            .query_row(
                "SELECT person_id FROM detected_faces WHERE id = ?",
                [face_id],
                |row| row.get(0),
            )
            .unwrap_or(None);

        tx.execute(
            "UPDATE detected_faces SET person_id = NULL WHERE id = ?",
            [face_id],
        )?;
        if let Some(person_id) = previous {
            tx.execute(
                "UPDATE persons SET face_count = MAX(face_count - 1, 0) WHERE id = ?",
                [person_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Reassign all of source's faces to target, then delete source.
    /// Returns the number of faces moved.
    pub fn merge_persons(&self, source_id: i64, target_id: i64) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let moved = tx.execute(
            "UPDATE detected_faces SET person_id = ? WHERE person_id = ?",
            params![target_id, source_id],
        )?;
        tx.execute(
            "UPDATE persons SET face_count = face_count + ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            params![moved as i64, target_id],
        )?;
        tx.execute("DELETE FROM persons WHERE id = ?", [source_id])?;
        tx.commit()?;
        Ok(moved)
    }

    /// Delete automatic persons that ended up with zero faces. Manual
    /// persons are the user's and are never reaped.
    pub fn delete_orphan_persons(&self) -> Result<usize> {
        let deleted = self.conn().execute(
            r#"
            DELETE FROM persons
            WHERE is_manual = 0
              AND id NOT IN (SELECT DISTINCT person_id FROM detected_faces WHERE person_id IS NOT NULL)
            "#,
            [],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::photos::NewPhoto;

    fn store_with_photo() -> (VectorStore, i64) {
        let store = VectorStore::open_in_memory().unwrap();
        let photo_id = store
            .insert_photo(&NewPhoto {
                uuid: "u1".into(),
                path: "/photos/a.jpg".into(),
                filename: "a.jpg".into(),
                directory: "/photos".into(),
                taken_at: None,
                width: Some(4160),
                height: Some(3120),
                exif_json: None,
                location_json: None,
            })
            .unwrap();
        (store, photo_id)
    }

    fn detection(face: Option<Vec<f32>>, semantic: Option<Vec<f32>>) -> NewDetection {
        NewDetection {
            bbox: BoundingBox { x: 10, y: 20, width: 30, height: 40 },
            confidence: 0.9,
            face_embedding: face,
            semantic_embedding: semantic,
        }
    }

    #[test]
    fn test_bbox_scaling_to_image_space() {
        let bbox = BoundingBox { x: 104, y: 104, width: 208, height: 208 };
        let scaled = bbox.scaled(416, 832, 1664);
        assert_eq!(scaled, BoundingBox { x: 208, y: 416, width: 416, height: 832 });
    }

    #[test]
    fn test_vector_version_tracks_slots() {
        let (store, photo_id) = store_with_photo();
        let ids = store
            .replace_photo_detections(
                photo_id,
                &[
                    detection(None, None),
                    detection(Some(vec![1.0; 128]), None),
                    detection(Some(vec![1.0; 128]), Some(vec![0.5; 512])),
                    // semantic without descriptor is dropped
                    detection(None, Some(vec![0.5; 512])),
                ],
            )
            .unwrap();

        let versions: Vec<i64> = ids
            .iter()
            .map(|id| store.face_by_id(*id).unwrap().unwrap().vector_version)
            .collect();
        assert_eq!(versions, vec![0, 1, 2, 0]);

        let dropped = store.face_by_id(ids[3]).unwrap().unwrap();
        assert!(dropped.semantic_embedding.is_none());
    }

    #[test]
    fn test_replace_is_delete_then_insert() {
        let (store, photo_id) = store_with_photo();
        store
            .replace_photo_detections(photo_id, &[detection(Some(vec![1.0; 128]), None), detection(None, None)])
            .unwrap();
        assert_eq!(store.count_faces().unwrap(), 2);

        // A re-scan replaces wholesale, not merges
        store
            .replace_photo_detections(photo_id, &[detection(Some(vec![2.0; 128]), None)])
            .unwrap();
        assert_eq!(store.count_faces().unwrap(), 1);
    }

    #[test]
    fn test_replace_fixes_person_counts() {
        let (store, photo_id) = store_with_photo();
        let ids = store
            .replace_photo_detections(photo_id, &[detection(Some(vec![1.0; 128]), None)])
            .unwrap();
        let person_id = store.create_person("Ada", true).unwrap();
        store.assign_face_to_person(ids[0], person_id).unwrap();
        assert_eq!(store.person(person_id).unwrap().unwrap().face_count, 1);

        store.replace_photo_detections(photo_id, &[]).unwrap();
        assert_eq!(store.person(person_id).unwrap().unwrap().face_count, 0);
    }

    #[test]
    fn test_merge_persons_moves_faces_and_deletes_source() {
        let (store, photo_id) = store_with_photo();
        let ids = store
            .replace_photo_detections(
                photo_id,
                &(0..5).map(|_| detection(Some(vec![1.0; 128]), None)).collect::<Vec<_>>(),
            )
            .unwrap();

        let source = store.create_person("Unnamed 1", false).unwrap();
        let target = store.create_person("Grace", true).unwrap();
        store.assign_faces_to_person(&ids[..3], source).unwrap();
        store.assign_faces_to_person(&ids[3..], target).unwrap();

        let moved = store.merge_persons(source, target).unwrap();
        assert_eq!(moved, 3);
        assert!(store.person(source).unwrap().is_none());
        assert_eq!(store.person(target).unwrap().unwrap().face_count, 5);

        // No detection may still reference the deleted id
        for id in &ids {
            let face = store.face_by_id(*id).unwrap().unwrap();
            assert_eq!(face.person_id, Some(target));
        }
    }

    #[test]
    fn test_unassign_keeps_detection() {
        let (store, photo_id) = store_with_photo();
        let ids = store
            .replace_photo_detections(photo_id, &[detection(Some(vec![1.0; 128]), None)])
            .unwrap();
        let person_id = store.create_person("Ada", true).unwrap();
        store.assign_face_to_person(ids[0], person_id).unwrap();

        store.unassign_face(ids[0]).unwrap();
        let face = store.face_by_id(ids[0]).unwrap().unwrap();
        assert!(face.person_id.is_none());
        assert_eq!(store.person(person_id).unwrap().unwrap().face_count, 0);
    }

    #[test]
    fn test_orphan_cleanup_spares_manual_persons() {
        let (store, _) = store_with_photo();
        store.create_person("Unnamed 1", false).unwrap();
        let manual = store.create_person("Ada", true).unwrap();

        let deleted = store.delete_orphan_persons().unwrap();
        assert_eq!(deleted, 1);
        assert!(store.person(manual).unwrap().is_some());
    }

    #[test]
    fn test_update_face_vectors_upgrades_version() {
        let (store, photo_id) = store_with_photo();
        let ids = store
            .replace_photo_detections(photo_id, &[detection(Some(vec![1.0; 128]), None)])
            .unwrap();

        let needing = store.faces_needing_vectors(10).unwrap();
        assert_eq!(needing.len(), 1);

        store
            .update_face_vectors(ids[0], Some(&vec![1.0; 128]), Some(&vec![0.5; 512]))
            .unwrap();
        let face = store.face_by_id(ids[0]).unwrap().unwrap();
        assert_eq!(face.vector_version, 2);
        assert!(store.faces_needing_vectors(10).unwrap().is_empty());
    }
}
