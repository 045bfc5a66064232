//! Binary snapshot serialization of a collection.
//!
//! A collection serializes into five files in its snapshot directory:
//! `fields`, `stats`, `itemsData`, `itemsTree`, `valuesTree`, `indexTree`.
//! Every file begins and ends with the 8-byte snapshot id; a mismatch on
//! load fails with a checksum error. Items are numbered densely in id order
//! by `itemsData`; the three tree files reference those numbers.

use crate::collection::{Collection, Item};
use crate::field_values::{FieldSlot, FieldValues};
use meridian_core::error::{Error, Result};
use meridian_core::{geojson, Object};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};

const FIELDS_FILE: &str = "fields";
const STATS_FILE: &str = "stats";
const ITEMS_DATA_FILE: &str = "itemsData";
const ITEMS_TREE_FILE: &str = "itemsTree";
const VALUES_TREE_FILE: &str = "valuesTree";
const INDEX_TREE_FILE: &str = "indexTree";

/// Number of worker threads used to parse item payloads on load.
fn load_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    if cpus > 10 {
        10
    } else {
        2
    }
}

impl Collection {
    /// Serialize the collection into `dir`.
    pub fn save(&self, dir: &Path, snapshot_id: u64) -> Result<()> {
        self.save_fields(&dir.join(FIELDS_FILE), snapshot_id)?;
        self.save_stats(&dir.join(STATS_FILE), snapshot_id)?;
        let item_nums = self.save_items(
            &dir.join(ITEMS_DATA_FILE),
            &dir.join(ITEMS_TREE_FILE),
            snapshot_id,
        )?;
        self.save_values_tree(&dir.join(VALUES_TREE_FILE), &item_nums, snapshot_id)?;
        self.save_index_tree(&dir.join(INDEX_TREE_FILE), &item_nums, snapshot_id)?;
        Ok(())
    }

    /// Rebuild a collection from `dir`.
    pub fn load(dir: &Path, snapshot_id: u64) -> Result<Collection> {
        let mut col = Collection::new();
        col.load_fields(&dir.join(FIELDS_FILE), snapshot_id)?;
        col.load_stats(&dir.join(STATS_FILE), snapshot_id)?;
        let items = load_items_data(&dir.join(ITEMS_DATA_FILE), snapshot_id)?;
        col.load_items_tree(&dir.join(ITEMS_TREE_FILE), &items, snapshot_id)?;
        col.load_values_tree(&dir.join(VALUES_TREE_FILE), &items, snapshot_id)?;
        col.load_index_tree(&dir.join(INDEX_TREE_FILE), &items, snapshot_id)?;
        Ok(col)
    }

    fn save_fields(&self, path: &Path, snapshot_id: u64) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(&snapshot_id.to_be_bytes())?;
        w.write_all(&(self.field_map.len() as u64).to_be_bytes())?;
        for (name, idx) in &self.field_map {
            write_string(&mut w, name)?;
            w.write_all(&(*idx as u64).to_be_bytes())?;
        }
        self.field_values.save(&mut w, self.field_arr.len())?;
        w.write_all(&snapshot_id.to_be_bytes())?;
        w.flush()?;
        debug!(file = %path.display(), "saved fields");
        Ok(())
    }

    fn load_fields(&mut self, path: &Path, snapshot_id: u64) -> Result<()> {
        let mut r = BufReader::new(File::open(path)?);
        verify_snapshot_id(&mut r, snapshot_id)?;
        let n_fields = read_u64(&mut r)? as usize;
        self.field_map = HashMap::with_capacity(n_fields);
        self.field_arr = Vec::with_capacity(n_fields);
        for _ in 0..n_fields {
            let name = read_string(&mut r)?;
            let idx = read_u64(&mut r)? as usize;
            self.field_map.insert(name.clone(), idx);
            let pos = self
                .field_arr
                .binary_search(&name)
                .unwrap_or_else(|pos| pos);
            self.field_arr.insert(pos, name);
        }
        self.field_values = FieldValues::load(&mut r)?;
        verify_snapshot_id(&mut r, snapshot_id)?;
        Ok(())
    }

    fn save_stats(&self, path: &Path, snapshot_id: u64) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(&snapshot_id.to_be_bytes())?;
        for v in [self.weight, self.points, self.objects, self.nobjects] {
            w.write_all(&(v as u64).to_be_bytes())?;
        }
        w.write_all(&snapshot_id.to_be_bytes())?;
        w.flush()?;
        Ok(())
    }

    fn load_stats(&mut self, path: &Path, snapshot_id: u64) -> Result<()> {
        let mut r = BufReader::new(File::open(path)?);
        verify_snapshot_id(&mut r, snapshot_id)?;
        self.weight = read_u64(&mut r)? as usize;
        self.points = read_u64(&mut r)? as usize;
        self.objects = read_u64(&mut r)? as usize;
        self.nobjects = read_u64(&mut r)? as usize;
        verify_snapshot_id(&mut r, snapshot_id)?;
        Ok(())
    }

    /// Write item payloads (data file) and the id-ordered tree file. Items
    /// are assigned dense numbers in traversal order; the returned map keys
    /// item ids to their numbers for the other tree files.
    fn save_items(
        &self,
        data_path: &Path,
        tree_path: &Path,
        snapshot_id: u64,
    ) -> Result<HashMap<Arc<str>, u32>> {
        let mut dw = BufWriter::new(File::create(data_path)?);
        let mut tw = BufWriter::new(File::create(tree_path)?);
        dw.write_all(&snapshot_id.to_be_bytes())?;
        tw.write_all(&snapshot_id.to_be_bytes())?;
        dw.write_all(&(self.items.len() as u32).to_be_bytes())?;
        tw.write_all(&(self.items.len() as u32).to_be_bytes())?;

        let mut item_nums = HashMap::with_capacity(self.items.len());
        let mut item_num: u32 = 0;
        for (id, item) in &self.items {
            item_nums.insert(id.clone(), item_num);
            tw.write_all(&item_num.to_be_bytes())?;

            write_string(&mut dw, id)?;
            dw.write_all(&item.slot.to_raw().to_be_bytes())?;
            dw.write_all(&[item.obj.is_spatial() as u8])?;
            write_string(&mut dw, &item.obj.string_repr())?;
            item_num += 1;
        }

        dw.write_all(&snapshot_id.to_be_bytes())?;
        tw.write_all(&snapshot_id.to_be_bytes())?;
        dw.flush()?;
        tw.flush()?;
        Ok(item_nums)
    }

    fn load_items_tree(
        &mut self,
        path: &Path,
        items: &[(Arc<str>, Arc<Object>, FieldSlot)],
        snapshot_id: u64,
    ) -> Result<()> {
        let mut r = BufReader::new(File::open(path)?);
        verify_snapshot_id(&mut r, snapshot_id)?;
        let count = read_u32(&mut r)? as usize;
        for _ in 0..count {
            let num = read_u32(&mut r)? as usize;
            let (id, obj, slot) = items
                .get(num)
                .ok_or_else(|| Error::SnapshotFailure(format!("item {} out of range", num)))?;
            self.items.insert(
                id.clone(),
                Item {
                    obj: obj.clone(),
                    slot: *slot,
                },
            );
        }
        verify_snapshot_id(&mut r, snapshot_id)?;
        Ok(())
    }

    fn save_values_tree(
        &self,
        path: &Path,
        item_nums: &HashMap<Arc<str>, u32>,
        snapshot_id: u64,
    ) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(&snapshot_id.to_be_bytes())?;
        w.write_all(&(self.values.len() as u32).to_be_bytes())?;
        for (_, id) in &self.values {
            w.write_all(&item_nums[id].to_be_bytes())?;
        }
        w.write_all(&snapshot_id.to_be_bytes())?;
        w.flush()?;
        Ok(())
    }

    fn load_values_tree(
        &mut self,
        path: &Path,
        items: &[(Arc<str>, Arc<Object>, FieldSlot)],
        snapshot_id: u64,
    ) -> Result<()> {
        let mut r = BufReader::new(File::open(path)?);
        verify_snapshot_id(&mut r, snapshot_id)?;
        let count = read_u32(&mut r)? as usize;
        for _ in 0..count {
            let num = read_u32(&mut r)? as usize;
            let (id, obj, _) = items
                .get(num)
                .ok_or_else(|| Error::SnapshotFailure(format!("value {} out of range", num)))?;
            self.values
                .insert((Arc::from(obj.string_repr()), id.clone()));
        }
        verify_snapshot_id(&mut r, snapshot_id)?;
        Ok(())
    }

    fn save_index_tree(
        &self,
        path: &Path,
        item_nums: &HashMap<Arc<str>, u32>,
        snapshot_id: u64,
    ) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(&snapshot_id.to_be_bytes())?;
        self.index.save(&mut w, &mut |w, id| {
            w.write_all(&item_nums[id].to_be_bytes())
        })?;
        w.write_all(&snapshot_id.to_be_bytes())?;
        w.flush()?;
        Ok(())
    }

    fn load_index_tree(
        &mut self,
        path: &Path,
        items: &[(Arc<str>, Arc<Object>, FieldSlot)],
        snapshot_id: u64,
    ) -> Result<()> {
        let mut r = BufReader::new(File::open(path)?);
        verify_snapshot_id(&mut r, snapshot_id)?;
        self.index = meridian_index::RTree::load(&mut r, &mut |r| {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf)?;
            let num = u32::from_be_bytes(buf) as usize;
            items
                .get(num)
                .map(|(id, _, _)| id.clone())
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad item"))
        })?;
        verify_snapshot_id(&mut r, snapshot_id)?;
        Ok(())
    }
}

/// Raw item payload as stored on disk, before object parsing.
struct RawItem {
    id: String,
    slot: FieldSlot,
    spatial: bool,
    body: String,
}

/// Read and parse all item payloads. GeoJSON parsing spreads across worker
/// threads; the read itself stays sequential.
fn load_items_data(
    path: &Path,
    snapshot_id: u64,
) -> Result<Vec<(Arc<str>, Arc<Object>, FieldSlot)>> {
    let mut r = BufReader::new(File::open(path)?);
    verify_snapshot_id(&mut r, snapshot_id)?;
    let count = read_u32(&mut r)? as usize;

    let mut raw = Vec::with_capacity(count);
    for _ in 0..count {
        let id = read_string(&mut r)?;
        let mut slot_buf = [0u8; 4];
        r.read_exact(&mut slot_buf)?;
        let mut spatial_buf = [0u8; 1];
        r.read_exact(&mut spatial_buf)?;
        let body = read_string(&mut r)?;
        raw.push(RawItem {
            id,
            slot: FieldSlot::from_raw(i32::from_be_bytes(slot_buf)),
            spatial: spatial_buf[0] != 0,
            body,
        });
    }
    verify_snapshot_id(&mut r, snapshot_id)?;

    let mut out: Vec<Option<(Arc<str>, Arc<Object>, FieldSlot)>> = Vec::new();
    out.resize_with(raw.len(), || None);
    let workers = load_workers();
    let chunk = raw.len().div_ceil(workers.max(1)).max(1);
    let results: Vec<Result<()>> = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for (raw_chunk, out_chunk) in raw.chunks(chunk).zip(out.chunks_mut(chunk)) {
            handles.push(scope.spawn(move || -> Result<()> {
                for (item, slot_out) in raw_chunk.iter().zip(out_chunk.iter_mut()) {
                    let obj = if item.spatial {
                        geojson::parse(&item.body).map_err(|err| {
                            error!(id = %item.id, "failed to parse snapshot object");
                            err
                        })?
                    } else {
                        Object::String(item.body.clone())
                    };
                    *slot_out = Some((Arc::from(item.id.as_str()), Arc::new(obj), item.slot));
                }
                Ok(())
            }));
        }
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for result in results {
        result?;
    }
    Ok(out.into_iter().map(|v| v.expect("worker filled slot")).collect())
}

fn write_string(w: &mut dyn Write, s: &str) -> std::io::Result<()> {
    w.write_all(&(s.len() as u64).to_be_bytes())?;
    w.write_all(s.as_bytes())
}

fn read_string(r: &mut dyn Read) -> Result<String> {
    let len = read_u64(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| Error::SnapshotFailure("non-utf8 string in snapshot".into()))
}

fn read_u64(r: &mut dyn Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

fn read_u32(r: &mut dyn Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn verify_snapshot_id(r: &mut dyn Read, snapshot_id: u64) -> Result<()> {
    let word = read_u64(r)?;
    if word != snapshot_id {
        error!(expected = snapshot_id, found = word, "snapshot id mismatch");
        return Err(Error::SnapshotFailure(format!(
            "snapshot id mismatch: expected {:x} found {:x}",
            snapshot_id, word
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::geometry::{Point, Rect};
    use meridian_txn::Status;

    fn build_collection() -> Collection {
        let mut c = Collection::new();
        c.set(
            "truck1",
            Object::point(-115.0, 33.0),
            &["speed".into()],
            &[55.0],
        );
        c.set("truck2", Object::point_z(-114.0, 34.0, 400.0), &[], &[]);
        c.set("note", Object::String("hello world".into()), &[], &[]);
        c.set(
            "zone",
            Object::Polygon(meridian_core::geometry::Poly::from_rect(&Rect::new(
                -120.0, 30.0, -110.0, 40.0,
            ))),
            &[],
            &[],
        );
        // churn a field slot so the freelist is non-trivial
        c.set("gone", Object::point(0.0, 0.0), &["speed".into()], &[1.0]);
        c.delete("gone");
        c
    }

    #[test]
    fn test_save_load_round_trip() {
        let col = build_collection();
        let dir = tempfile::tempdir().unwrap();
        let id = 0xDEADBEEFu64;
        col.save(dir.path(), id).unwrap();

        for file in [
            "fields",
            "stats",
            "itemsData",
            "itemsTree",
            "valuesTree",
            "indexTree",
        ] {
            let data = std::fs::read(dir.path().join(file)).unwrap();
            assert_eq!(&data[..8], &id.to_be_bytes(), "{} head", file);
            assert_eq!(&data[data.len() - 8..], &id.to_be_bytes(), "{} tail", file);
        }

        let loaded = Collection::load(dir.path(), id).unwrap();
        assert_eq!(loaded.count(), col.count());
        assert_eq!(loaded.string_count(), col.string_count());
        assert_eq!(loaded.point_count(), col.point_count());
        assert_eq!(loaded.total_weight(), col.total_weight());
        assert_eq!(loaded.field_arr(), col.field_arr());

        let (obj, fields) = loaded.get("truck1").unwrap();
        assert_eq!(*obj, Object::point(-115.0, 33.0));
        assert_eq!(fields, &[55.0]);
        assert_eq!(loaded.get("truck2").unwrap().0.z(), Some(400.0));
        assert_eq!(
            loaded.get("note").unwrap().0.string_repr(),
            "hello world"
        );

        // the spatial index came back: query it
        let mut found = Vec::new();
        loaded
            .within(
                &Object::Rect(Rect::new(-116.0, 32.0, -113.0, 35.0)),
                0,
                None,
                &Status::background(),
                &mut |id, _, _| {
                    found.push(id.to_string());
                    true
                },
            )
            .unwrap();
        found.sort();
        assert_eq!(found, vec!["truck1", "truck2"]);

        // value index came back too
        let mut vals = Vec::new();
        loaded
            .search_values(false, None, &Status::background(), &mut |id, _, _| {
                vals.push(id.to_string());
                true
            })
            .unwrap();
        assert_eq!(vals, vec!["note"]);

        // freelist survived: the next field row reuses the freed slot
        let mut loaded = loaded;
        let before = loaded.field_values.live_rows();
        loaded.set("new", Object::point(1.0, 1.0), &["speed".into()], &[2.0]);
        assert_eq!(loaded.field_values.live_rows(), before + 1);
    }

    #[test]
    fn test_id_mismatch_fails() {
        let col = build_collection();
        let dir = tempfile::tempdir().unwrap();
        col.save(dir.path(), 42).unwrap();
        match Collection::load(dir.path(), 43) {
            Err(Error::SnapshotFailure(_)) => {}
            other => panic!("expected snapshot failure, got {:?}", other),
        }
    }

    #[test]
    fn test_circle_survives_round_trip() {
        let mut col = Collection::new();
        col.set(
            "c1",
            Object::Circle(meridian_core::object::Circle::new(
                Point::new(-115.0, 33.0),
                5_000.0,
                64,
            )),
            &[],
            &[],
        );
        let dir = tempfile::tempdir().unwrap();
        col.save(dir.path(), 7).unwrap();
        let loaded = Collection::load(dir.path(), 7).unwrap();
        match loaded.get("c1").unwrap().0.as_ref() {
            Object::Circle(c) => assert_eq!(c.meters(), 5_000.0),
            other => panic!("expected circle, got {:?}", other),
        }
    }
}
