//! Text and binary sample files.
//!
//! A file starts with a line-oriented header naming the body format, the image size, the
//! sample layout and one `property` line per record field, and ends the header with
//! `end_header`. The body holds one record per sample, either as whitespace-separated
//! numbers one per line, or as packed 4-byte words in the declared byte order.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use glam::{Vec2, Vec4};
use tracing::info;

use crate::error::{ReconError, ReconResult};
use crate::samples::{ChannelData, ChannelId, SampleBuffer};

mod header;
mod records;

pub use header::Format;

use header::{Header, LayoutDecl, Property};
use records::{AsciiFormat, BinaryFormat, Endian, FormatReader};

const BASE_NAMES: [&str; 12] = ["x", "y", "z", "w", "u", "v", "t", "r", "g", "b", "a", "weight"];

/// Loads a sample file, transparently decompressing `.gz` files.
pub fn load_samples(path: impl AsRef<Path>) -> ReconResult<SampleBuffer> {
    let path = path.as_ref();
    let t = Instant::now();
    let file = File::open(path)?;
    let buffer = match path.extension().and_then(|s| s.to_str()) {
        Some("gz") => read_samples(BufReader::new(GzDecoder::new(file)))?,
        _ => read_samples(BufReader::new(file))?,
    };
    info!(
        path = %path.display(),
        samples = buffer.len(),
        width = buffer.width(),
        height = buffer.height(),
        elapsed = ?t.elapsed(),
        "loaded samples"
    );
    Ok(buffer)
}

/// Parses a complete sample file. Nothing is returned unless every record validated.
pub fn read_samples<R: BufRead>(mut data: R) -> ReconResult<SampleBuffer> {
    let header = header::read_header(&mut data)?;
    let fields = header.fields();

    let mut format: Box<dyn FormatReader + '_> = match header.format {
        Format::Ascii => Box::new(AsciiFormat::new(&mut data, fields, header.lines)),
        Format::BinaryLe => Box::new(BinaryFormat::new(
            &mut data,
            Endian::Little,
            fields,
            header.lines,
        )),
        Format::BinaryBe => Box::new(BinaryFormat::new(
            &mut data,
            Endian::Big,
            fields,
            header.lines,
        )),
    };

    let int_fields: Vec<bool> = header
        .properties
        .iter()
        .flat_map(|p| {
            let int = p.kind() == crate::samples::ChannelKind::Int;
            std::iter::repeat_n(int, p.components())
        })
        .collect();

    let mut placement = Placement::new(&header);
    let mut staged: Vec<f32> = Vec::with_capacity((header.count * fields).min(1 << 24));
    let mut pixels: Vec<u32> = Vec::with_capacity(header.count.min(1 << 22));
    let mut targets: Vec<usize> = Vec::with_capacity(header.count.min(1 << 22));
    while format.begin_record()? {
        if pixels.len() == header.count {
            return Err(ReconError::load(
                format.location(),
                format!("more than the {} declared samples", header.count),
            ));
        }
        let start = staged.len();
        // Int fields are staged as raw bits, see `ChannelData::write_components`.
        for &int in &int_fields {
            staged.push(match int {
                true => f32::from_bits(format.read_int()? as u32),
                false => format.read_float()?,
            });
        }
        let (pixel, target) = placement.place(&staged[start..], format.location())?;
        pixels.push(pixel);
        targets.push(target);
    }
    if pixels.len() != header.count {
        return Err(ReconError::load(
            format.location(),
            format!("expected {} samples, found {}", header.count, pixels.len()),
        ));
    }

    let mut buffer = match header.layout {
        LayoutDecl::Regular(spp) => SampleBuffer::new(header.width, header.height, spp),
        LayoutDecl::Irregular => {
            let mut counts = vec![0u32; header.width as usize * header.height as usize];
            pixels.iter().for_each(|&p| counts[p as usize] += 1);
            SampleBuffer::new_irregular(header.width, header.height, &counts)?
        }
    };

    let field = |prop: &Property| header.offset(prop);
    let [z, w, u, v, t, a, weight] = [
        Property::Z,
        Property::W,
        Property::U,
        Property::V,
        Property::T,
        Property::A,
        Property::Weight,
    ]
    .map(|p| field(&p));
    let [x, y, r, g, b] = [Property::X, Property::Y, Property::R, Property::G, Property::B]
        .map(|p| field(&p).unwrap_or_default());
    let get = |record: &[f32], offset: Option<usize>, default: f32| match offset {
        Some(o) => record[o],
        None => default,
    };

    {
        let base = buffer.base_mut();
        for (record, &idx) in staged.chunks_exact(fields).zip(&targets) {
            base.xy[idx] = Vec2::new(record[x], record[y]);
            base.uv[idx] = Vec2::new(get(record, u, 0.0), get(record, v, 0.0));
            base.t[idx] = get(record, t, 0.0);
            base.z[idx] = get(record, z, 0.0);
            base.w[idx] = get(record, w, 0.0);
            base.color[idx] = Vec4::new(record[r], record[g], record[b], get(record, a, 1.0));
            base.weight[idx] = get(record, weight, 1.0);
        }
    }

    for prop in &header.properties {
        let Property::Extra { name, kind } = prop else {
            continue;
        };
        let offset = field(prop).unwrap_or_default();
        let id = buffer.reserve_channel_kind(name, *kind)?;
        let data = buffer.channel_data_mut(id);
        for (record, &idx) in staged.chunks_exact(fields).zip(&targets) {
            data.write_components(idx, &record[offset..offset + kind.components()]);
        }
    }

    Ok(buffer)
}

/// Per-record validation and the mapping from record order to storage order.
struct Placement {
    width: u32,
    height: u32,
    x: usize,
    y: usize,
    u: Option<usize>,
    v: Option<usize>,
    t: Option<usize>,
    layout: LayoutDecl,
    filled: Vec<u32>,
    last_pixel: u32,
    records: usize,
}

impl Placement {
    fn new(header: &Header) -> Self {
        let filled = match header.layout {
            LayoutDecl::Regular(_) => vec![0; header.width as usize * header.height as usize],
            LayoutDecl::Irregular => vec![],
        };
        Placement {
            width: header.width,
            height: header.height,
            x: header.offset(&Property::X).unwrap_or_default(),
            y: header.offset(&Property::Y).unwrap_or_default(),
            u: header.offset(&Property::U),
            v: header.offset(&Property::V),
            t: header.offset(&Property::T),
            layout: header.layout,
            filled,
            last_pixel: 0,
            records: 0,
        }
    }

    /// Checks one record. Returns the row-major index of its pixel and its flat storage index.
    fn place(&mut self, record: &[f32], line: usize) -> ReconResult<(u32, usize)> {
        let (x, y) = (record[self.x], record[self.y]);
        let inside = |v: f32, extent: u32| v >= 0.0 && v < extent as f32;
        if !inside(x, self.width) || !inside(y, self.height) {
            return Err(ReconError::load(
                line,
                format!(
                    "sample at ({x}, {y}) lies outside the {}x{} image",
                    self.width, self.height
                ),
            ));
        }
        for (name, offset) in [("u", self.u), ("v", self.v)] {
            if let Some(o) = offset
                && !(-1.0..=1.0).contains(&record[o])
            {
                return Err(ReconError::load(
                    line,
                    format!("lens coordinate {name} = {} outside [-1, 1]", record[o]),
                ));
            }
        }
        if let Some(o) = self.t
            && !(0.0..=1.0).contains(&record[o])
        {
            return Err(ReconError::load(
                line,
                format!("time {} outside [0, 1]", record[o]),
            ));
        }

        let (px, py) = (x as u32, y as u32);
        let pixel = py * self.width + px;
        let target = match self.layout {
            LayoutDecl::Regular(spp) => {
                let slot = &mut self.filled[pixel as usize];
                if *slot == spp {
                    return Err(ReconError::load(
                        line,
                        format!("pixel ({px}, {py}) has more than {spp} samples"),
                    ));
                }
                *slot += 1;
                pixel as usize * spp as usize + *slot as usize - 1
            }
            LayoutDecl::Irregular => {
                if pixel < self.last_pixel {
                    return Err(ReconError::load(
                        line,
                        format!(
                            "sample for pixel ({px}, {py}) follows a later pixel; \
                             irregular files must be in row-major order"
                        ),
                    ));
                }
                self.last_pixel = pixel;
                self.records
            }
        };
        self.records += 1;
        Ok((pixel, target))
    }
}

/// Writes `buffer` in the sample file format, with every base attribute and channel.
pub fn write_samples<W: Write>(buffer: &SampleBuffer, out: W, format: Format) -> ReconResult<()> {
    let mut out = BufWriter::new(out);
    writeln!(out, "samples 1.0")?;
    writeln!(out, "format {} 1.0", format.name())?;
    writeln!(out, "dimensions {} {}", buffer.width(), buffer.height())?;
    match buffer.samples_per_pixel() {
        Some(spp) => writeln!(out, "layout regular {spp}")?,
        None => writeln!(out, "layout irregular")?,
    }
    writeln!(out, "element sample {}", buffer.len())?;
    for name in BASE_NAMES {
        writeln!(out, "property float {name}")?;
    }
    let channels: Vec<ChannelId> = buffer.channel_ids().collect();
    for &id in &channels {
        writeln!(
            out,
            "property {} {}",
            id.kind().name(),
            buffer.channel_name(id)
        )?;
    }
    writeln!(out, "end_header")?;

    let mut record = vec![];
    let mut scratch = [0.0; 4];
    for idx in 0..buffer.len() {
        record.clear();
        let xy = buffer.xy()[idx];
        let uv = buffer.uv()[idx];
        let c = buffer.colors()[idx];
        record.extend(
            [
                xy.x,
                xy.y,
                buffer.z()[idx],
                buffer.w()[idx],
                uv.x,
                uv.y,
                buffer.t()[idx],
                c.x,
                c.y,
                c.z,
                c.w,
                buffer.weights()[idx],
            ]
            .map(Field::Float),
        );
        for &id in &channels {
            match buffer.channel_data(id) {
                ChannelData::Int(v) => record.push(Field::Int(v[idx])),
                data => {
                    let n = id.kind().components();
                    data.read_components(idx, &mut scratch);
                    record.extend(scratch[..n].iter().copied().map(Field::Float));
                }
            }
        }
        write_record(&mut out, &record, format)?;
    }
    out.flush()?;
    Ok(())
}

/// Writes a sample file to `path`, gzip-compressed when the extension is `.gz`.
pub fn save_samples(
    buffer: &SampleBuffer,
    path: impl AsRef<Path>,
    format: Format,
) -> ReconResult<()> {
    let path = path.as_ref();
    let file = File::create(path)?;
    match path.extension().and_then(|s| s.to_str()) {
        Some("gz") => {
            let mut encoder = GzEncoder::new(file, Compression::default());
            write_samples(buffer, &mut encoder, format)?;
            encoder.finish()?;
        }
        _ => write_samples(buffer, file, format)?,
    }
    Ok(())
}

#[derive(Copy, Clone)]
enum Field {
    Float(f32),
    Int(i32),
}

fn write_record(out: &mut impl Write, record: &[Field], format: Format) -> ReconResult<()> {
    let endian = match format {
        Format::Ascii => {
            for (i, field) in record.iter().enumerate() {
                if i > 0 {
                    out.write_all(b" ")?;
                }
                match field {
                    Field::Float(v) => write!(out, "{v}")?,
                    Field::Int(v) => write!(out, "{v}")?,
                }
            }
            out.write_all(b"\n")?;
            return Ok(());
        }
        Format::BinaryLe => Endian::Little,
        Format::BinaryBe => Endian::Big,
    };
    let words: Vec<u32> = record
        .iter()
        .map(|f| match *f {
            Field::Float(v) => v.to_bits(),
            Field::Int(v) => v as u32,
        })
        .map(|w| endian.encode(w))
        .collect();
    out.write_all(bytemuck::cast_slice(&words))?;
    Ok(())
}
