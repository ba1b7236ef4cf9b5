//! PCD v0.7 point-cloud persistence.
//!
//! Files carry the engine's native fields `x y z intensity laser_id time`
//! and one of three data sections: `ascii`, `binary` (packed little-endian
//! rows) or `binary_compressed` (LZF over a field-major block, framed by
//! two little-endian u32 sizes, as written by PCL).

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::lzf;
use crate::core::types::{LidarPoint, PointCloud};
use crate::engine::error::{Result, SlamError};

/// On-disk data section layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PcdFormat {
    /// Human-readable text rows.
    Ascii,
    /// Packed little-endian binary rows.
    Binary,
    /// LZF-compressed field-major binary.
    #[default]
    BinaryCompressed,
}

impl PcdFormat {
    fn data_keyword(&self) -> &'static str {
        match self {
            PcdFormat::Ascii => "ascii",
            PcdFormat::Binary => "binary",
            PcdFormat::BinaryCompressed => "binary_compressed",
        }
    }
}

const FIELDS: &str = "x y z intensity laser_id time";
/// Bytes per point in row layout: 3x f64 + f32 + u8 + f64.
pub(crate) const ROW_SIZE: usize = 8 * 3 + 4 + 1 + 8;

/// Write a cloud to a PCD file.
pub fn save_pcd(cloud: &PointCloud, path: &Path, format: PcdFormat) -> Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);

    write!(
        w,
        "# .PCD v0.7 - Point Cloud Data file format\n\
         VERSION 0.7\n\
         FIELDS {FIELDS}\n\
         SIZE 8 8 8 4 1 8\n\
         TYPE F F F F U F\n\
         COUNT 1 1 1 1 1 1\n\
         WIDTH {n}\n\
         HEIGHT 1\n\
         VIEWPOINT 0 0 0 1 0 0 0\n\
         POINTS {n}\n\
         DATA {data}\n",
        n = cloud.len(),
        data = format.data_keyword()
    )?;

    match format {
        PcdFormat::Ascii => {
            for p in &cloud.points {
                writeln!(
                    w,
                    "{} {} {} {} {} {}",
                    p.x, p.y, p.z, p.intensity, p.laser_id, p.time
                )?;
            }
        }
        PcdFormat::Binary => {
            for p in &cloud.points {
                w.write_all(&pack_row(p))?;
            }
        }
        PcdFormat::BinaryCompressed => {
            let soa = pack_points_soa(&cloud.points);
            let packed = lzf::compress(&soa);
            w.write_all(&(packed.len() as u32).to_le_bytes())?;
            w.write_all(&(soa.len() as u32).to_le_bytes())?;
            w.write_all(&packed)?;
        }
    }
    w.flush()?;
    Ok(())
}

/// Read a cloud from a PCD file. Sweep metadata is not stored on disk, so
/// the returned cloud has a zero timestamp and empty frame id.
pub fn load_pcd(path: &Path) -> Result<PointCloud> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut nb_points: Option<usize> = None;
    let mut format: Option<PcdFormat> = None;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(format_error(path, "truncated header"));
        }
        let line = line.trim_end();
        if line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("FIELDS") => {
                let rest: Vec<&str> = tokens.collect();
                if rest.join(" ") != FIELDS {
                    return Err(format_error(
                        path,
                        &format!("unsupported fields '{}'", rest.join(" ")),
                    ));
                }
            }
            Some("POINTS") => {
                let count: usize = tokens
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| format_error(path, "bad POINTS line"))?;
                nb_points = Some(count);
            }
            Some("DATA") => {
                format = match tokens.next() {
                    Some("ascii") => Some(PcdFormat::Ascii),
                    Some("binary") => Some(PcdFormat::Binary),
                    Some("binary_compressed") => Some(PcdFormat::BinaryCompressed),
                    other => {
                        return Err(format_error(
                            path,
                            &format!("unsupported data section {:?}", other),
                        ))
                    }
                };
                break;
            }
            _ => {}
        }
    }

    let n = nb_points.ok_or_else(|| format_error(path, "missing POINTS"))?;
    let format = format.ok_or_else(|| format_error(path, "missing DATA"))?;

    let points = match format {
        PcdFormat::Ascii => {
            let mut points = Vec::with_capacity(n);
            for _ in 0..n {
                let mut line = String::new();
                if reader.read_line(&mut line)? == 0 {
                    return Err(format_error(path, "truncated ascii body"));
                }
                points.push(parse_ascii_row(line.trim(), path)?);
            }
            points
        }
        PcdFormat::Binary => {
            let mut body = vec![0u8; n * ROW_SIZE];
            reader.read_exact(&mut body).map_err(SlamError::from)?;
            body.chunks_exact(ROW_SIZE).map(unpack_row).collect()
        }
        PcdFormat::BinaryCompressed => {
            let mut sizes = [0u8; 8];
            reader.read_exact(&mut sizes)?;
            let compressed = u32::from_le_bytes(sizes[0..4].try_into().unwrap()) as usize;
            let uncompressed = u32::from_le_bytes(sizes[4..8].try_into().unwrap()) as usize;
            let mut body = vec![0u8; compressed];
            reader.read_exact(&mut body)?;
            let soa = lzf::decompress(&body, uncompressed)
                .map_err(|reason| format_error(path, &reason))?;
            unpack_points_soa(&soa, n).map_err(|reason| format_error(path, &reason))?
        }
    };

    Ok(PointCloud::from_points(points, 0, ""))
}

fn format_error(path: &Path, reason: &str) -> SlamError {
    SlamError::Format {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn parse_ascii_row(line: &str, path: &Path) -> Result<LidarPoint> {
    let mut it = line.split_whitespace();
    let mut next_f64 = |name: &str| -> Result<f64> {
        it.next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| format_error(path, &format!("bad {} value", name)))
    };
    let x = next_f64("x")?;
    let y = next_f64("y")?;
    let z = next_f64("z")?;
    let intensity = next_f64("intensity")? as f32;
    let laser_id = next_f64("laser_id")? as u8;
    let time = next_f64("time")?;
    Ok(LidarPoint {
        x,
        y,
        z,
        intensity,
        laser_id,
        time,
    })
}

fn pack_row(p: &LidarPoint) -> [u8; ROW_SIZE] {
    let mut row = [0u8; ROW_SIZE];
    row[0..8].copy_from_slice(&p.x.to_le_bytes());
    row[8..16].copy_from_slice(&p.y.to_le_bytes());
    row[16..24].copy_from_slice(&p.z.to_le_bytes());
    row[24..28].copy_from_slice(&p.intensity.to_le_bytes());
    row[28] = p.laser_id;
    row[29..37].copy_from_slice(&p.time.to_le_bytes());
    row
}

fn unpack_row(row: &[u8]) -> LidarPoint {
    LidarPoint {
        x: f64::from_le_bytes(row[0..8].try_into().unwrap()),
        y: f64::from_le_bytes(row[8..16].try_into().unwrap()),
        z: f64::from_le_bytes(row[16..24].try_into().unwrap()),
        intensity: f32::from_le_bytes(row[24..28].try_into().unwrap()),
        laser_id: row[28],
        time: f64::from_le_bytes(row[29..37].try_into().unwrap()),
    }
}

/// Pack points field-major (all x, all y, ...), the layout PCL compresses.
pub(crate) fn pack_points_soa(points: &[LidarPoint]) -> Vec<u8> {
    let n = points.len();
    let mut out = Vec::with_capacity(n * ROW_SIZE);
    for p in points {
        out.extend_from_slice(&p.x.to_le_bytes());
    }
    for p in points {
        out.extend_from_slice(&p.y.to_le_bytes());
    }
    for p in points {
        out.extend_from_slice(&p.z.to_le_bytes());
    }
    for p in points {
        out.extend_from_slice(&p.intensity.to_le_bytes());
    }
    for p in points {
        out.push(p.laser_id);
    }
    for p in points {
        out.extend_from_slice(&p.time.to_le_bytes());
    }
    out
}

/// Inverse of [`pack_points_soa`].
pub(crate) fn unpack_points_soa(
    bytes: &[u8],
    n: usize,
) -> std::result::Result<Vec<LidarPoint>, String> {
    if bytes.len() != n * ROW_SIZE {
        return Err(format!(
            "field block holds {} bytes, expected {}",
            bytes.len(),
            n * ROW_SIZE
        ));
    }
    let f64_at = |base: usize, i: usize| {
        f64::from_le_bytes(bytes[base + i * 8..base + i * 8 + 8].try_into().unwrap())
    };
    let (xb, yb, zb) = (0, n * 8, n * 16);
    let ib = n * 24;
    let lb = n * 28;
    let tb = n * 29;
    Ok((0..n)
        .map(|i| LidarPoint {
            x: f64_at(xb, i),
            y: f64_at(yb, i),
            z: f64_at(zb, i),
            intensity: f32::from_le_bytes(bytes[ib + i * 4..ib + i * 4 + 4].try_into().unwrap()),
            laser_id: bytes[lb + i],
            time: f64_at(tb, i),
        })
        .collect())
}
