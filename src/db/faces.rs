//! Face embedding rows.

use rusqlite::{params, Connection};

use super::{parse_timestamp, Database};
use crate::error::Result;

/// Bounding box for a detected face
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn area(&self) -> i64 {
        self.width.max(0) as i64 * self.height.max(0) as i64
    }

    /// Intersection over Union; 1 = identical, 0 = disjoint
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0) as i64 * (y2 - y1).max(0) as i64;
        let union = self.area() + other.area() - intersection;

        if union > 0 {
            intersection as f32 / union as f32
        } else {
            0.0
        }
    }
}

/// A face about to be committed with its photo.
#[derive(Debug, Clone)]
pub struct NewFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub backend: String,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct StoredFace {
    pub photo_id: i64,
    pub face_index: u32,
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub backend: String,
    pub confidence: f32,
}

/// Face sets of every completed photo, grouped per photo in id order.
pub struct CompletedPhotoFaces {
    pub photo_id: i64,
    pub event_id: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub faces: Vec<StoredFace>,
}

impl Database {
    pub fn get_faces_for_photo(&self, photo_id: i64) -> Result<Vec<StoredFace>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT photo_id, face_index, bbox_x, bbox_y, bbox_w, bbox_h, embedding, backend, confidence
            FROM faces
            WHERE photo_id = ?
            ORDER BY face_index
            "#,
        )?;

        let faces = stmt
            .query_map([photo_id], row_to_face)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    /// Everything the in-memory index needs at startup.
    pub fn load_completed_faces(&self) -> Result<Vec<CompletedPhotoFaces>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT f.photo_id, f.face_index, f.bbox_x, f.bbox_y, f.bbox_w, f.bbox_h,
                   f.embedding, f.backend, f.confidence, p.event_id, p.created_at
            FROM faces f
            JOIN photos p ON p.id = f.photo_id
            WHERE p.status = 'completed'
            ORDER BY f.photo_id, f.face_index
            "#,
        )?;

        let mut grouped: Vec<CompletedPhotoFaces> = Vec::new();
        let rows = stmt.query_map([], |row| {
            Ok((row_to_face(row)?, row.get::<_, i64>(9)?, parse_timestamp(10, row.get(10)?)?))
        })?;

        for row in rows {
            let (face, event_id, created_at) = row?;
            match grouped.last_mut() {
                Some(last) if last.photo_id == face.photo_id => last.faces.push(face),
                _ => grouped.push(CompletedPhotoFaces {
                    photo_id: face.photo_id,
                    event_id,
                    created_at,
                    faces: vec![face],
                }),
            }
        }

        Ok(grouped)
    }
}

/// Replace a photo's whole face set. Callers run this inside a transaction.
pub(crate) fn replace_faces(conn: &Connection, photo_id: i64, faces: &[NewFace]) -> Result<()> {
    conn.execute("DELETE FROM faces WHERE photo_id = ?", [photo_id])?;

    let mut stmt = conn.prepare(
        r#"
        INSERT INTO faces (photo_id, face_index, bbox_x, bbox_y, bbox_w, bbox_h,
                           embedding, embedding_dim, backend, confidence)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )?;
    for (index, face) in faces.iter().enumerate() {
        stmt.execute(params![
            photo_id,
            index as i64,
            face.bbox.x,
            face.bbox.y,
            face.bbox.width,
            face.bbox.height,
            embedding_to_bytes(&face.embedding),
            face.embedding.len() as i64,
            face.backend,
            face.confidence,
        ])?;
    }
    Ok(())
}

fn row_to_face(row: &rusqlite::Row) -> rusqlite::Result<StoredFace> {
    let bytes: Vec<u8> = row.get(6)?;
    Ok(StoredFace {
        photo_id: row.get(0)?,
        face_index: row.get::<_, i64>(1)? as u32,
        bbox: BoundingBox {
            x: row.get(2)?,
            y: row.get(3)?,
            width: row.get(4)?,
            height: row.get(5)?,
        },
        embedding: bytes_to_embedding(&bytes),
        backend: row.get(7)?,
        confidence: row.get(8)?,
    })
}

/// Convert embedding to bytes for storage
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Convert bytes back to embedding
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou() {
        let a = BoundingBox { x: 0, y: 0, width: 10, height: 10 };
        let b = BoundingBox { x: 0, y: 0, width: 10, height: 10 };
        assert!((a.iou(&b) - 1.0).abs() < 0.001);

        let c = BoundingBox { x: 20, y: 20, width: 10, height: 10 };
        assert!((a.iou(&c) - 0.0).abs() < 0.001);

        // Half overlap: 50 / 150
        let d = BoundingBox { x: 5, y: 0, width: 10, height: 10 };
        assert!((a.iou(&d) - 1.0 / 3.0).abs() < 0.001);
    }

    #[test]
    fn test_degenerate_box_has_no_overlap() {
        let a = BoundingBox { x: 0, y: 0, width: 0, height: 0 };
        assert_eq!(a.iou(&a), 0.0);
        assert_eq!(a.area(), 0);
    }

    #[test]
    fn test_embedding_conversion() {
        let original = vec![1.5, -2.3, 0.0, 100.0];
        let bytes = embedding_to_bytes(&original);
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes_to_embedding(&bytes), original);
    }
}
