use std::collections::BTreeMap;
use std::io::Cursor;

use kamadak_exif::experimental::Writer;
use kamadak_exif::{Context, Field, In, Rational, Reader, SRational, Tag, Value};

use super::MetadataError;

/// `ImageDescription` (IFD0), the field captions are written to.
pub const TAG_IMAGE_DESCRIPTION: u16 = 0x010E;

// Thumbnail location in IFD1. Derived from the thumbnail bytes on write.
const TAG_THUMBNAIL_OFFSET: u16 = 0x0201;
const TAG_THUMBNAIL_LENGTH: u16 = 0x0202;

const EXIF_PREFIX: &[u8] = b"Exif\0\0";
const IFD_ENTRY_LEN: usize = 12;

/// Tag → value map of a single section.
pub type Fields = BTreeMap<u16, FieldValue>;

/// A named group of metadata fields (one TIFF IFD).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
    /// IFD0: image-level fields such as `ImageDescription`, `Make`, `Model`.
    Primary,
    /// Exif sub-IFD: capture settings and timestamps.
    Exif,
    /// GPS sub-IFD.
    Gps,
    /// Interoperability sub-IFD, linked from the Exif IFD.
    Interop,
    /// IFD1: fields describing the embedded thumbnail.
    Thumbnail,
}

impl Section {
    pub const ALL: [Section; 5] = [
        Section::Primary,
        Section::Exif,
        Section::Gps,
        Section::Interop,
        Section::Thumbnail,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Section::Primary => "primary",
            Section::Exif => "exif",
            Section::Gps => "gps",
            Section::Interop => "interop",
            Section::Thumbnail => "thumbnail",
        }
    }

    fn index(self) -> usize {
        match self {
            Section::Primary => 0,
            Section::Exif => 1,
            Section::Gps => 2,
            Section::Interop => 3,
            Section::Thumbnail => 4,
        }
    }

    /// Tag context and IFD number this section is stored under.
    fn location(self) -> (Context, In) {
        match self {
            Section::Primary => (Context::Tiff, In::PRIMARY),
            Section::Exif => (Context::Exif, In::PRIMARY),
            Section::Gps => (Context::Gps, In::PRIMARY),
            Section::Interop => (Context::Interop, In::PRIMARY),
            Section::Thumbnail => (Context::Tiff, In::THUMBNAIL),
        }
    }

    /// Inverse of [`location`](Self::location). Sub-IFDs of IFD1 and any
    /// IFD past it have no section.
    fn of(field: &Field) -> Option<Section> {
        match (field.tag.context(), field.ifd_num) {
            (Context::Tiff, In::PRIMARY) => Some(Section::Primary),
            (Context::Exif, In::PRIMARY) => Some(Section::Exif),
            (Context::Gps, In::PRIMARY) => Some(Section::Gps),
            (Context::Interop, In::PRIMARY) => Some(Section::Interop),
            (Context::Tiff, In::THUMBNAIL) => Some(Section::Thumbnail),
            _ => None,
        }
    }
}

/// Byte order of a TIFF-structured block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// `II`
    #[default]
    Little,
    /// `MM`
    Big,
}

impl ByteOrder {
    fn is_little_endian(self) -> bool {
        self == ByteOrder::Little
    }

    fn read_u16(self, data: &[u8], offset: usize) -> Option<u16> {
        let bytes: [u8; 2] = data.get(offset..offset.checked_add(2)?)?.try_into().ok()?;
        Some(match self {
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        })
    }

    fn read_u32(self, data: &[u8], offset: usize) -> Option<u32> {
        let bytes: [u8; 4] = data.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
        Some(match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        })
    }
}

/// A typed field value (TIFF 6.0 field types 1 to 12).
///
/// `Ascii` holds the bytes as stored, NUL terminators included. Several
/// strings in one field are separated by their NULs.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Byte(Vec<u8>),
    Ascii(Vec<u8>),
    Short(Vec<u16>),
    Long(Vec<u32>),
    Rational(Vec<(u32, u32)>),
    SByte(Vec<i8>),
    Undefined(Vec<u8>),
    SShort(Vec<i16>),
    SLong(Vec<i32>),
    SRational(Vec<(i32, i32)>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl FieldValue {
    pub fn type_code(&self) -> u16 {
        match self {
            FieldValue::Byte(_) => 1,
            FieldValue::Ascii(_) => 2,
            FieldValue::Short(_) => 3,
            FieldValue::Long(_) => 4,
            FieldValue::Rational(_) => 5,
            FieldValue::SByte(_) => 6,
            FieldValue::Undefined(_) => 7,
            FieldValue::SShort(_) => 8,
            FieldValue::SLong(_) => 9,
            FieldValue::SRational(_) => 10,
            FieldValue::Float(_) => 11,
            FieldValue::Double(_) => 12,
        }
    }

    /// Number of components (the TIFF `count`).
    pub fn count(&self) -> usize {
        match self {
            FieldValue::Byte(v) | FieldValue::Ascii(v) | FieldValue::Undefined(v) => v.len(),
            FieldValue::Short(v) => v.len(),
            FieldValue::Long(v) => v.len(),
            FieldValue::Rational(v) => v.len(),
            FieldValue::SByte(v) => v.len(),
            FieldValue::SShort(v) => v.len(),
            FieldValue::SLong(v) => v.len(),
            FieldValue::SRational(v) => v.len(),
            FieldValue::Float(v) => v.len(),
            FieldValue::Double(v) => v.len(),
        }
    }

    /// `None` for entries whose type code the reader did not recognise.
    fn from_value(value: &Value) -> Option<Self> {
        let converted = match value {
            Value::Byte(v) => FieldValue::Byte(v.clone()),
            Value::Ascii(strings) => {
                let mut raw = Vec::new();
                for s in strings {
                    raw.extend_from_slice(s);
                    raw.push(0);
                }
                FieldValue::Ascii(raw)
            }
            Value::Short(v) => FieldValue::Short(v.clone()),
            Value::Long(v) => FieldValue::Long(v.clone()),
            Value::Rational(v) => {
                FieldValue::Rational(v.iter().map(|r| (r.num, r.denom)).collect())
            }
            Value::SByte(v) => FieldValue::SByte(v.clone()),
            Value::Undefined(v, _) => FieldValue::Undefined(v.clone()),
            Value::SShort(v) => FieldValue::SShort(v.clone()),
            Value::SLong(v) => FieldValue::SLong(v.clone()),
            Value::SRational(v) => {
                FieldValue::SRational(v.iter().map(|r| (r.num, r.denom)).collect())
            }
            Value::Float(v) => FieldValue::Float(v.clone()),
            Value::Double(v) => FieldValue::Double(v.clone()),
            Value::Unknown(..) => return None,
        };
        Some(converted)
    }

    fn to_value(&self) -> Value {
        match self {
            FieldValue::Byte(v) => Value::Byte(v.clone()),
            FieldValue::Ascii(raw) => {
                // The writer terminates every string, so the stored NULs
                // become separators.
                let mut strings: Vec<Vec<u8>> =
                    raw.split(|&b| b == 0).map(<[u8]>::to_vec).collect();
                if strings.last().is_some_and(Vec::is_empty) {
                    strings.pop();
                }
                Value::Ascii(strings)
            }
            FieldValue::Short(v) => Value::Short(v.clone()),
            FieldValue::Long(v) => Value::Long(v.clone()),
            FieldValue::Rational(v) => Value::Rational(
                v.iter()
                    .map(|&(num, denom)| Rational { num, denom })
                    .collect(),
            ),
            FieldValue::SByte(v) => Value::SByte(v.clone()),
            FieldValue::Undefined(v) => Value::Undefined(v.clone(), 0),
            FieldValue::SShort(v) => Value::SShort(v.clone()),
            FieldValue::SLong(v) => Value::SLong(v.clone()),
            FieldValue::SRational(v) => Value::SRational(
                v.iter()
                    .map(|&(num, denom)| SRational { num, denom })
                    .collect(),
            ),
            FieldValue::Float(v) => Value::Float(v.clone()),
            FieldValue::Double(v) => Value::Double(v.clone()),
        }
    }
}

/// An EXIF block decoded into sections of typed fields.
///
/// Decoding and encoding go through `kamadak-exif`. Every field it can type
/// is kept, and [`to_bytes`](Self::to_bytes) writes them back in the block's
/// original byte order. Sub-IFD and thumbnail pointers are recomputed, so
/// fields can be added or replaced without corrupting the rest of the block.
///
/// ```rust
/// use exif_caption::exif::{MetadataContainer, Section};
///
/// let mut container = MetadataContainer::new();
/// container.set_description("a dog running on a beach").unwrap();
///
/// let bytes = container.to_bytes().unwrap();
/// let parsed = MetadataContainer::parse(&bytes).unwrap();
/// assert_eq!(parsed.description().as_deref(), Some("a dog running on a beach"));
/// assert!(parsed.section(Section::Exif).is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetadataContainer {
    byte_order: ByteOrder,
    sections: [Fields; 5],
    thumbnail: Option<Vec<u8>>,
}

impl MetadataContainer {
    /// An empty container: every section present, none populated.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty container that will serialize in the given byte order.
    pub fn with_byte_order(byte_order: ByteOrder) -> Self {
        Self {
            byte_order,
            ..Self::default()
        }
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn section(&self, section: Section) -> &Fields {
        &self.sections[section.index()]
    }

    pub fn get(&self, section: Section, tag: u16) -> Option<&FieldValue> {
        self.section(section).get(&tag)
    }

    /// Set a field, returning the previous value.
    ///
    /// Sub-IFD and thumbnail pointer tags are layout, not data: they are
    /// accepted here but ignored by [`to_bytes`](Self::to_bytes).
    pub fn set(&mut self, section: Section, tag: u16, value: FieldValue) -> Option<FieldValue> {
        self.sections[section.index()].insert(tag, value)
    }

    pub fn remove(&mut self, section: Section, tag: u16) -> Option<FieldValue> {
        self.sections[section.index()].remove(&tag)
    }

    /// The embedded JPEG thumbnail referenced from IFD1, if any.
    pub fn thumbnail(&self) -> Option<&[u8]> {
        self.thumbnail.as_deref()
    }

    pub fn set_thumbnail(&mut self, thumbnail: Option<Vec<u8>>) {
        self.thumbnail = thumbnail;
    }

    /// True when no section holds a field and there is no thumbnail.
    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(BTreeMap::is_empty) && self.thumbnail.is_none()
    }

    /// The `ImageDescription` text, up to its NUL terminator.
    pub fn description(&self) -> Option<String> {
        match self.get(Section::Primary, TAG_IMAGE_DESCRIPTION)? {
            FieldValue::Ascii(raw) => {
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                Some(String::from_utf8_lossy(&raw[..end]).into_owned())
            }
            _ => None,
        }
    }

    /// Replace `ImageDescription` with `text` as NUL-terminated UTF-8.
    pub fn set_description(&mut self, text: &str) -> Result<(), MetadataError> {
        if text.is_empty() {
            return Err(MetadataError::Encoding("caption is empty".into()));
        }
        if text.contains('\0') {
            return Err(MetadataError::Encoding(
                "caption contains a NUL character".into(),
            ));
        }

        let mut raw = Vec::with_capacity(text.len() + 1);
        raw.extend_from_slice(text.as_bytes());
        raw.push(0);
        self.set(Section::Primary, TAG_IMAGE_DESCRIPTION, FieldValue::Ascii(raw));
        Ok(())
    }

    /// Decode a TIFF-structured EXIF payload. A leading `Exif\0\0` is accepted.
    ///
    /// A block whose IFD0 cannot be read is [`MetadataError::Malformed`]. When
    /// only the chain after IFD0 is broken, the thumbnail IFD is dropped with a
    /// warning and the rest is kept.
    pub fn parse(data: &[u8]) -> Result<Self, MetadataError> {
        let tiff = data.strip_prefix(EXIF_PREFIX).unwrap_or(data);
        let reader = Reader::new();

        let exif = match reader.read_raw(tiff.to_vec()) {
            Ok(exif) => exif,
            Err(err) => {
                let primary_only = detach_ifd1(tiff).ok_or_else(|| malformed(&err))?;
                let exif = reader.read_raw(primary_only).map_err(|_| malformed(&err))?;
                log::warn!("Dropping the thumbnail IFD of an EXIF block: {err}");
                exif
            }
        };

        let byte_order = if exif.little_endian() {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        };
        let mut container = Self::with_byte_order(byte_order);
        let mut thumbnail_offset = None;
        let mut thumbnail_length = None;

        for field in exif.fields() {
            let Some(section) = Section::of(field) else {
                log::warn!("Dropping {} from the {} IFD", field.tag, field.ifd_num);
                continue;
            };

            let tag = field.tag.number();
            if section == Section::Thumbnail {
                match tag {
                    TAG_THUMBNAIL_OFFSET => {
                        thumbnail_offset = field.value.get_uint(0);
                        continue;
                    }
                    TAG_THUMBNAIL_LENGTH => {
                        thumbnail_length = field.value.get_uint(0);
                        continue;
                    }
                    _ => {}
                }
            }

            match FieldValue::from_value(&field.value) {
                Some(value) => {
                    container.sections[section.index()].insert(tag, value);
                }
                None => log::debug!("Skipping {} tag {tag:#06x}: unknown type", section.name()),
            }
        }

        if let (Some(offset), Some(length)) = (thumbnail_offset, thumbnail_length) {
            let start = offset as usize;
            match exif.buf().get(start..start.saturating_add(length as usize)) {
                Some(bytes) => container.thumbnail = Some(bytes.to_vec()),
                None => log::warn!("Thumbnail lies outside the EXIF block, dropping it"),
            }
        }

        Ok(container)
    }

    /// Serialize to a TIFF-structured payload (no `Exif\0\0` prefix).
    ///
    /// An empty container has no IFD0 to write and is an
    /// [`MetadataError::Encoding`] error.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MetadataError> {
        let fields: Vec<Field> = Section::ALL
            .into_iter()
            .flat_map(move |section| {
                let (context, ifd_num) = section.location();
                self.section(section).iter().map(move |(&tag, value)| Field {
                    tag: Tag(context, tag),
                    ifd_num,
                    value: value.to_value(),
                })
            })
            .collect();

        let mut writer = Writer::new();
        for field in &fields {
            writer.push_field(field);
        }
        if let Some(thumbnail) = &self.thumbnail {
            writer.set_jpeg(thumbnail, In::THUMBNAIL);
        }

        let mut out = Cursor::new(Vec::new());
        writer
            .write(&mut out, self.byte_order.is_little_endian())
            .map_err(|e| MetadataError::Encoding(e.to_string()))?;
        Ok(out.into_inner())
    }
}

fn malformed(err: &kamadak_exif::Error) -> MetadataError {
    MetadataError::Malformed(err.to_string())
}

/// A copy of `tiff` with IFD0's next-IFD offset cleared, or `None` when
/// IFD0 itself is unreadable or already ends the chain.
fn detach_ifd1(tiff: &[u8]) -> Option<Vec<u8>> {
    let order = match tiff.get(0..2)? {
        b"II" => ByteOrder::Little,
        b"MM" => ByteOrder::Big,
        _ => return None,
    };
    let ifd0 = order.read_u32(tiff, 4)? as usize;
    let count = order.read_u16(tiff, ifd0)? as usize;
    let next_at = ifd0.checked_add(2 + count * IFD_ENTRY_LEN)?;
    if order.read_u32(tiff, next_at)? == 0 {
        return None;
    }

    let mut patched = tiff.to_vec();
    patched[next_at..next_at + 4].fill(0);
    Some(patched)
}
