//! Items and the static item-type table loaded at boot.
//!
//! Two files describe item types: the binary sprite-data file carries the
//! per-type flag stream (ground, container, stackable, ...) and the XML file
//! overlays names and free-form attributes such as weight and maxitems.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::xml::{attribute, XmlEvent, XmlScanner};

/// First type id in the binary data file; everything below is reserved.
pub const FIRST_ITEM_TYPE_ID: u16 = 100;

/// Stack-position entries with this item id are creatures, not items.
pub const CREATURE_MARKER_ID: u16 = 99;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ItemTypeId(pub u16);

/// An item instance on a tile, in equipment or inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item {
    pub type_id: ItemTypeId,
    pub count: u8,
    pub subtype: u8,
}

impl Item {
    pub fn new(type_id: ItemTypeId) -> Self {
        Self {
            type_id,
            count: 1,
            subtype: 0,
        }
    }

    pub fn with_count(type_id: ItemTypeId, count: u8) -> Self {
        Self {
            type_id,
            count,
            subtype: 0,
        }
    }
}

/// Static attributes shared by all items of one type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemType {
    pub id: ItemTypeId,
    pub name: String,
    pub ground: bool,
    /// Walk cost of the ground; 0 means the ground itself blocks.
    pub speed: u16,
    pub always_on_top: bool,
    pub container: bool,
    pub stackable: bool,
    pub usable: bool,
    pub multitype: bool,
    pub blocking: bool,
    pub not_movable: bool,
    pub equipable: bool,
    pub attributes: HashMap<String, String>,
}

impl ItemType {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Container capacity from the `maxitems` attribute.
    pub fn max_items(&self) -> Option<u16> {
        self.attribute("maxitems").and_then(|v| v.parse().ok())
    }

    pub fn weight(&self) -> Option<f32> {
        self.attribute("weight").and_then(|v| v.parse().ok())
    }

    pub fn description(&self) -> Option<&str> {
        self.attribute("description")
    }
}

#[derive(Debug, Error)]
pub enum ItemLoadError {
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("item data file is truncated at offset {0}")]
    TruncatedData(usize),
    #[error("item data file has unknown option byte 0x{0:02x}")]
    UnknownOption(u8),
    #[error("items file: {0}")]
    BadItemsFile(String),
}

#[derive(Debug, Default, Clone)]
pub struct ItemTypeIndex {
    types: HashMap<ItemTypeId, ItemType>,
}

impl ItemTypeIndex {
    pub fn get(&self, id: ItemTypeId) -> Option<&ItemType> {
        self.types.get(&id)
    }

    pub fn contains(&self, id: ItemTypeId) -> bool {
        self.types.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Loads the binary flag stream, then the XML name/attribute overlay.
    pub fn load(data_path: &Path, items_path: &Path) -> Result<Self, ItemLoadError> {
        let data = std::fs::read(data_path).map_err(|source| ItemLoadError::Read {
            path: data_path.display().to_string(),
            source,
        })?;
        let mut index = Self::from_flag_stream(&data)?;

        let xml = std::fs::read_to_string(items_path).map_err(|source| ItemLoadError::Read {
            path: items_path.display().to_string(),
            source,
        })?;
        index.apply_items_xml(&xml)?;

        info!(
            "loaded {} item types from {} and {}",
            index.len(),
            data_path.display(),
            items_path.display()
        );
        Ok(index)
    }

    /// Parses the binary data file: a 12-byte header, then per type a list
    /// of option bytes terminated by 0xFF, followed by sprite dimensions
    /// that are skipped here.
    pub fn from_flag_stream(data: &[u8]) -> Result<Self, ItemLoadError> {
        let mut cursor = DataCursor::new(data);
        cursor.skip(12)?;

        let mut types = HashMap::new();
        let mut next_id = FIRST_ITEM_TYPE_ID;
        while !cursor.at_end() {
            let mut item = ItemType {
                id: ItemTypeId(next_id),
                ..ItemType::default()
            };

            loop {
                let opt = cursor.get_u8()?;
                match opt {
                    0xff => break,
                    0x00 => {
                        item.ground = true;
                        item.speed = u16::from(cursor.get_u8()?);
                        if item.speed == 0 {
                            item.blocking = true;
                        }
                        cursor.skip(1)?;
                    }
                    0x01 | 0x02 => item.always_on_top = true,
                    0x03 => item.container = true,
                    0x04 => item.stackable = true,
                    0x05 => item.usable = true,
                    0x0a => item.multitype = true,
                    0x0b => item.blocking = true,
                    0x0c => item.not_movable = true,
                    0x0f => item.equipable = true,
                    // Light source: color and radius, unused here.
                    0x10 => cursor.skip(4)?,
                    0x06 | 0x09 | 0x0d | 0x0e | 0x11 | 0x12 | 0x14 | 0x18 | 0x19 => {}
                    0x07 | 0x08 | 0x13 | 0x16 | 0x1a => cursor.skip(2)?,
                    other => return Err(ItemLoadError::UnknownOption(other)),
                }
            }

            // Sprite block: dimensions, frame counts, then pixel ids.
            let width = cursor.get_u8()? as usize;
            let height = cursor.get_u8()? as usize;
            if width > 1 || height > 1 {
                cursor.skip(1)?;
            }
            let blend_frames = cursor.get_u8()? as usize;
            let xdiv = cursor.get_u8()? as usize;
            let ydiv = cursor.get_u8()? as usize;
            let anim_count = cursor.get_u8()? as usize;
            cursor.skip(width * height * blend_frames * xdiv * ydiv * anim_count * 2)?;

            types.insert(item.id, item);
            next_id += 1;
        }

        debug!("item data file: {} types, last id {}", types.len(), next_id - 1);
        Ok(Self { types })
    }

    /// Applies `<items><item id name .../></items>` over loaded types. Every
    /// referenced id must already exist in the flag stream.
    pub fn apply_items_xml(&mut self, xml: &str) -> Result<(), ItemLoadError> {
        let mut scanner = XmlScanner::new(xml);
        let mut seen_items_node = false;
        while let Some(event) = scanner.next_event() {
            let XmlEvent::Open { name, attributes, .. } = event else {
                continue;
            };
            match name.as_str() {
                "items" => seen_items_node = true,
                "item" => {
                    let id: u16 = attribute(&attributes, "id")
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| {
                            ItemLoadError::BadItemsFile("<item> has no numeric id".to_string())
                        })?;
                    let item = self.types.get_mut(&ItemTypeId(id)).ok_or_else(|| {
                        ItemLoadError::BadItemsFile(format!(
                            "item {id} is not present in the data file"
                        ))
                    })?;
                    item.name = attribute(&attributes, "name")
                        .ok_or_else(|| {
                            ItemLoadError::BadItemsFile(format!("item {id} has no name"))
                        })?
                        .to_string();
                    for (key, value) in attributes {
                        if key != "id" && key != "name" {
                            item.attributes.insert(key, value);
                        }
                    }
                }
                _ => {}
            }
        }
        if !seen_items_node {
            return Err(ItemLoadError::BadItemsFile(
                "missing <items> root".to_string(),
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn insert_for_test(&mut self, item: ItemType) {
        self.types.insert(item.id, item);
    }
}

struct DataCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DataCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn get_u8(&mut self) -> Result<u8, ItemLoadError> {
        let value = *self
            .data
            .get(self.pos)
            .ok_or(ItemLoadError::TruncatedData(self.pos))?;
        self.pos += 1;
        Ok(value)
    }

    fn skip(&mut self, len: usize) -> Result<(), ItemLoadError> {
        if self.pos + len > self.data.len() {
            return Err(ItemLoadError::TruncatedData(self.pos));
        }
        self.pos += len;
        Ok(())
    }
}
