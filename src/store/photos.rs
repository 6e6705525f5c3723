//! Photo records. Owned by the ingestion collaborator; the core reads them
//! and only ever touches scan bookkeeping.

use anyhow::Result;
use rusqlite::params;

use super::VectorStore;

/// A photo row as stored.
#[derive(Debug, Clone)]
pub struct PhotoRecord {
    pub id: i64,
    pub uuid: String,
    pub path: String,
    pub filename: String,
    pub directory: String,
    pub taken_at: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub exif_json: Option<String>,
    pub location_json: Option<String>,
}

/// Input for photo registration.
#[derive(Debug, Clone)]
pub struct NewPhoto {
    pub uuid: String,
    pub path: String,
    pub filename: String,
    pub directory: String,
    pub taken_at: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub exif_json: Option<String>,
    pub location_json: Option<String>,
}

/// The text fields the keyword matcher scores against.
#[derive(Debug, Clone)]
pub struct PhotoText {
    pub photo_id: i64,
    pub path: String,
    pub filename: String,
    pub directory: String,
    pub taken_at: Option<String>,
    pub metadata_text: String,
}

fn row_to_photo(row: &rusqlite::Row<'_>) -> rusqlite::Result<PhotoRecord> {
    Ok(PhotoRecord {
        id: row.get(0)?,
        uuid: row.get(1)?,
        path: row.get(2)?,
        filename: row.get(3)?,
        directory: row.get(4)?,
        taken_at: row.get(5)?,
        width: row.get(6)?,
        height: row.get(7)?,
        exif_json: row.get(8)?,
        location_json: row.get(9)?,
    })
}

const PHOTO_COLUMNS: &str =
    "id, uuid, path, filename, directory, taken_at, width, height, exif_json, location_json";

impl VectorStore {
    /// Register a photo. A path already present is left untouched and its
    /// existing id is returned, so re-ingestion never duplicates a record.
    pub fn insert_photo(&self, photo: &NewPhoto) -> Result<i64> {
        let conn = self.conn();
        let inserted = conn.execute(
            r#"
            INSERT INTO photos (uuid, path, filename, directory, taken_at, width, height, exif_json, location_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO NOTHING
            "#,
            params![
                photo.uuid,
                photo.path,
                photo.filename,
                photo.directory,
                photo.taken_at,
                photo.width,
                photo.height,
                photo.exif_json,
                photo.location_json,
            ],
        )?;

        if inserted > 0 {
            return Ok(conn.last_insert_rowid());
        }

        let id: i64 = conn.query_row(
            "SELECT id FROM photos WHERE path = ?",
            [&photo.path],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn photo_by_id(&self, photo_id: i64) -> Result<Option<PhotoRecord>> {
        let conn = self.conn();
        let result = conn.query_row(
            &format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE id = ?"),
            [photo_id],
            row_to_photo,
        );
        match result {
            Ok(photo) => Ok(Some(photo)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn photo_by_uuid(&self, uuid: &str) -> Result<Option<PhotoRecord>> {
        let conn = self.conn();
        let result = conn.query_row(
            &format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE uuid = ?"),
            [uuid],
            row_to_photo,
        );
        match result {
            Ok(photo) => Ok(Some(photo)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn photo_by_path(&self, path: &str) -> Result<Option<PhotoRecord>> {
        let conn = self.conn();
        let result = conn.query_row(
            &format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE path = ?"),
            [path],
            row_to_photo,
        );
        match result {
            Ok(photo) => Ok(Some(photo)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Cursor-paginated pull of photos that have never been face-scanned,
    /// restricted to ids above `after_id`. This is what makes resume a
    /// continuation rather than a re-scan.
    pub fn unprocessed_photos(&self, limit: usize, after_id: i64) -> Result<Vec<(i64, String, String)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT p.id, p.uuid, p.path
            FROM photos p
            LEFT JOIN face_scans fs ON p.id = fs.photo_id
            WHERE fs.photo_id IS NULL
              AND p.id > ?
            ORDER BY p.id
            LIMIT ?
            "#,
        )?;

        let results = stmt
            .query_map(params![after_id, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(results)
    }

    pub fn count_unprocessed_photos(&self, after_id: i64) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            r#"
            SELECT COUNT(*)
            FROM photos p
            LEFT JOIN face_scans fs ON p.id = fs.photo_id
            WHERE fs.photo_id IS NULL
              AND p.id > ?
            "#,
            [after_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_photos(&self) -> Result<i64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM photos", [], |row| row.get(0))?;
        Ok(count)
    }

    /// All photos with their searchable text, for the keyword matcher.
    /// EXIF and location blobs are opaque JSON; they are matched as text.
    pub fn photos_for_keyword_scan(&self) -> Result<Vec<PhotoText>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, path, filename, directory, taken_at, exif_json, location_json FROM photos",
        )?;

        let results = stmt
            .query_map([], |row| {
                let exif: Option<String> = row.get(5)?;
                let location: Option<String> = row.get(6)?;
                let mut metadata_text = exif.unwrap_or_default();
                if let Some(loc) = location {
                    if !metadata_text.is_empty() {
                        metadata_text.push(' ');
                    }
                    metadata_text.push_str(&loc);
                }
                Ok(PhotoText {
                    photo_id: row.get(0)?,
                    path: row.get(1)?,
                    filename: row.get(2)?,
                    directory: row.get(3)?,
                    taken_at: row.get(4)?,
                    metadata_text,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_photo(path: &str) -> NewPhoto {
        NewPhoto {
            uuid: format!("uuid-{path}"),
            path: path.to_string(),
            filename: path.rsplit('/').next().unwrap_or(path).to_string(),
            directory: "/photos".to_string(),
            taken_at: None,
            width: Some(4000),
            height: Some(3000),
            exif_json: None,
            location_json: None,
        }
    }

    #[test]
    fn test_reingest_same_path_is_not_duplicated() {
        let store = VectorStore::open_in_memory().unwrap();
        let first = store.insert_photo(&test_photo("/photos/a.jpg")).unwrap();
        let second = store.insert_photo(&test_photo("/photos/a.jpg")).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.count_photos().unwrap(), 1);
    }

    #[test]
    fn test_unprocessed_respects_cursor() {
        let store = VectorStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.insert_photo(&test_photo(&format!("/photos/{i}.jpg"))).unwrap();
        }

        let all = store.unprocessed_photos(100, 0).unwrap();
        assert_eq!(all.len(), 5);

        // Resume from cursor 3: only photos with id > 3
        let tail = store.unprocessed_photos(100, 3).unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail.iter().all(|(id, _, _)| *id > 3));
    }

    #[test]
    fn test_unprocessed_excludes_scanned() {
        let store = VectorStore::open_in_memory().unwrap();
        let a = store.insert_photo(&test_photo("/photos/a.jpg")).unwrap();
        store.insert_photo(&test_photo("/photos/b.jpg")).unwrap();

        store.mark_photo_scanned(a, 0).unwrap();
        let remaining = store.unprocessed_photos(100, 0).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(store.count_unprocessed_photos(0).unwrap(), 1);
    }

    #[test]
    fn test_lookup_by_uuid_and_path() {
        let store = VectorStore::open_in_memory().unwrap();
        store.insert_photo(&test_photo("/photos/a.jpg")).unwrap();

        let by_path = store.photo_by_path("/photos/a.jpg").unwrap().unwrap();
        let by_uuid = store.photo_by_uuid(&by_path.uuid).unwrap().unwrap();
        assert_eq!(by_path.id, by_uuid.id);
        assert!(store.photo_by_path("/photos/missing.jpg").unwrap().is_none());
    }
}
