use std::io::BufRead;

use crate::error::{ReconError, ReconResult};
use crate::samples::ChannelKind;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    Ascii,
    BinaryLe,
    BinaryBe,
}

impl Format {
    pub fn name(self) -> &'static str {
        match self {
            Format::Ascii => "ascii",
            Format::BinaryLe => "binary_little_endian",
            Format::BinaryBe => "binary_big_endian",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum LayoutDecl {
    Regular(u32),
    Irregular,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Property {
    X,
    Y,
    Z,
    W,
    U,
    V,
    T,
    R,
    G,
    B,
    A,
    Weight,
    Extra { name: String, kind: ChannelKind },
}

impl Property {
    fn from_decl(kind: ChannelKind, name: &str) -> Property {
        match name {
            "x" => Property::X,
            "y" => Property::Y,
            "z" => Property::Z,
            "w" => Property::W,
            "u" => Property::U,
            "v" => Property::V,
            "t" => Property::T,
            "r" => Property::R,
            "g" => Property::G,
            "b" => Property::B,
            "a" => Property::A,
            "weight" => Property::Weight,
            _ => Property::Extra {
                name: name.to_owned(),
                kind,
            },
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Property::Extra { kind, .. } => *kind,
            _ => ChannelKind::Float,
        }
    }

    pub fn components(&self) -> usize {
        self.kind().components()
    }
}

pub(crate) struct Header {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub layout: LayoutDecl,
    pub count: usize,
    pub properties: Vec<Property>,
    /// Number of header lines consumed, for error locations in the body.
    pub lines: usize,
}

impl Header {
    pub fn fields(&self) -> usize {
        self.properties.iter().map(Property::components).sum()
    }

    /// Position of the first field of `prop` within a record.
    pub fn offset(&self, prop: &Property) -> Option<usize> {
        let mut offset = 0;
        for p in &self.properties {
            if p == prop {
                return Some(offset);
            }
            offset += p.components();
        }
        None
    }
}

pub(crate) fn read_header<R: BufRead>(data: &mut R) -> ReconResult<Header> {
    let mut format = None;
    let mut dimensions = None;
    let mut layout = None;
    let mut count = None;
    let mut properties: Vec<Property> = vec![];

    let mut line = String::new();
    let mut line_no = 0;
    loop {
        line.clear();
        line_no += 1;
        if data.read_line(&mut line)? == 0 {
            return Err(ReconError::load(line_no, "unexpected end of file in header"));
        }

        let mut words = line.split_whitespace();
        let Some(directive) = words.next() else {
            continue;
        };

        if line_no == 1 {
            if directive != "samples" {
                return Err(ReconError::load(line_no, "not a sample file"));
            }
            let version = words.next().unwrap_or("");
            if version != "1.0" {
                return Err(ReconError::load(
                    line_no,
                    format!("unsupported sample file version `{version}`"),
                ));
            }
            continue;
        }

        let mut next = |what: &str| {
            words
                .next()
                .ok_or_else(|| ReconError::load(line_no, format!("`{directive}` lacks {what}")))
        };

        match directive {
            "comment" => {}
            "end_header" => break,
            "format" => {
                format = Some(match next("a format")? {
                    "ascii" => Format::Ascii,
                    "binary_little_endian" => Format::BinaryLe,
                    "binary_big_endian" => Format::BinaryBe,
                    s => return Err(ReconError::load(line_no, format!("unknown format `{s}`"))),
                });
                let version = next("a version")?;
                if version != "1.0" {
                    return Err(ReconError::load(
                        line_no,
                        format!("only version 1.0 of the body format is supported, got {version}"),
                    ));
                }
            }
            "dimensions" => {
                let width = parse_u32(next("a width")?, line_no)?;
                let height = parse_u32(next("a height")?, line_no)?;
                if width == 0 || height == 0 {
                    return Err(ReconError::load(line_no, "image dimensions must be positive"));
                }
                dimensions = Some((width, height));
            }
            "layout" => {
                layout = Some(match next("a layout kind")? {
                    "regular" => {
                        let spp = parse_u32(next("samples per pixel")?, line_no)?;
                        LayoutDecl::Regular(spp)
                    }
                    "irregular" => LayoutDecl::Irregular,
                    s => return Err(ReconError::load(line_no, format!("unknown layout `{s}`"))),
                });
            }
            "element" => {
                let name = next("a name")?;
                if name != "sample" {
                    return Err(ReconError::load(line_no, format!("unknown element `{name}`")));
                }
                count = Some(parse_count(next("a count")?, line_no)?);
            }
            "property" => {
                let ty = next("a type")?;
                let kind = ChannelKind::from_name(ty)
                    .ok_or_else(|| ReconError::load(line_no, format!("unknown type `{ty}`")))?;
                let name = next("a name")?;
                let prop = Property::from_decl(kind, name);
                if !matches!(prop, Property::Extra { .. }) && kind != ChannelKind::Float {
                    return Err(ReconError::load(
                        line_no,
                        format!("base property `{name}` must be float"),
                    ));
                }
                let duplicate = properties.iter().any(|p| match (p, &prop) {
                    (Property::Extra { name: a, .. }, Property::Extra { name: b, .. }) => a == b,
                    (a, b) => a == b,
                });
                if duplicate {
                    return Err(ReconError::load(line_no, format!("duplicate property `{name}`")));
                }
                properties.push(prop);
            }
            s => return Err(ReconError::load(line_no, format!("unrecognized directive `{s}`"))),
        }
    }

    let format = format.ok_or_else(|| ReconError::load(line_no, "header lacks `format`"))?;
    let (width, height) =
        dimensions.ok_or_else(|| ReconError::load(line_no, "header lacks `dimensions`"))?;
    let layout = layout.ok_or_else(|| ReconError::load(line_no, "header lacks `layout`"))?;
    let count = count.ok_or_else(|| ReconError::load(line_no, "header lacks `element sample`"))?;

    for required in [Property::X, Property::Y, Property::R, Property::G, Property::B] {
        if !properties.contains(&required) {
            return Err(ReconError::load(
                line_no,
                format!("missing required property {required:?}"),
            ));
        }
    }

    if let LayoutDecl::Regular(spp) = layout {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(spp as usize));
        if expected != Some(count) {
            let expected = expected.map_or("more".to_owned(), |n| n.to_string());
            return Err(ReconError::load(
                line_no,
                format!("regular {width}x{height} at {spp} spp needs {expected} samples, header declares {count}"),
            ));
        }
    }

    Ok(Header {
        format,
        width,
        height,
        layout,
        count,
        properties,
        lines: line_no,
    })
}

fn parse_count(word: &str, line_no: usize) -> ReconResult<usize> {
    word.parse()
        .map_err(|_| ReconError::load(line_no, format!("expected a count, got `{word}`")))
}

fn parse_u32(word: &str, line_no: usize) -> ReconResult<u32> {
    let count = parse_count(word, line_no)?;
    u32::try_from(count)
        .map_err(|_| ReconError::load(line_no, format!("{count} does not fit in 32 bits")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "samples 1.0\n\
        format ascii 1.0\n\
        comment test scene\n\
        dimensions 4 2\n\
        layout regular 2\n\
        element sample 16\n\
        property float x\n\
        property float y\n\
        property float r\n\
        property float g\n\
        property float b\n\
        property vec3 PRIMARY_NORMAL\n\
        end_header\n";

    #[test]
    fn parses_a_complete_header() {
        let header = read_header(&mut HEADER.as_bytes()).unwrap();
        assert_eq!(header.format, Format::Ascii);
        assert_eq!((header.width, header.height), (4, 2));
        assert_eq!(header.layout, LayoutDecl::Regular(2));
        assert_eq!(header.count, 16);
        assert_eq!(header.fields(), 8);
        assert_eq!(header.lines, 13);
    }

    #[test]
    fn rejects_count_mismatch() {
        let text = HEADER.replace("element sample 16", "element sample 15");
        assert!(matches!(
            read_header(&mut text.as_bytes()),
            Err(ReconError::Load { line: 13, .. })
        ));
    }

    #[test]
    fn rejects_unknown_directives_and_missing_properties() {
        let text = HEADER.replace("comment test scene", "camera perspective");
        assert!(read_header(&mut text.as_bytes()).is_err());

        let text = HEADER.replace("property float g\n", "");
        assert!(read_header(&mut text.as_bytes()).is_err());
    }

    #[test]
    fn rejects_sizes_beyond_32_bits() {
        let text = HEADER.replace("dimensions 4 2", "dimensions 4294967300 2");
        assert!(matches!(
            read_header(&mut text.as_bytes()),
            Err(ReconError::Load { line: 4, .. })
        ));

        let text = HEADER.replace("layout regular 2", "layout regular 4294967298");
        assert!(matches!(
            read_header(&mut text.as_bytes()),
            Err(ReconError::Load { line: 5, .. })
        ));
    }
}
