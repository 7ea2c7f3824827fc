//! Single DEM raster representation and GeoTIFF I/O.

use crate::{DemError, GeoBounds, Result, TileId};
use std::fs;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

/// No-data value written into assembled rasters.
pub const DEFAULT_NODATA: f32 = -9999.0;

/// A single elevation raster with its georeferencing.
///
/// Used both for downloaded 1°×1° tiles and for assembled region mosaics.
#[derive(Debug, Clone)]
pub struct DemTile {
    /// Samples, row-major from the north-west corner.
    data: Vec<f32>,
    /// Width of the raster in pixels.
    width: u32,
    /// Height of the raster in pixels.
    height: u32,
    /// Geographic bounds (outer pixel edges).
    bounds: GeoBounds,
    /// Marker for missing samples.
    no_data_value: Option<f32>,
}

/// Summary of a raster that passed verification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterSummary {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Number of samples that are not no-data.
    pub valid_samples: usize,
}

impl DemTile {
    /// Build a raster from raw samples.
    pub fn new(
        data: Vec<f32>,
        width: u32,
        height: u32,
        bounds: GeoBounds,
        no_data_value: Option<f32>,
    ) -> Result<Self> {
        if width == 0 || height == 0 || data.len() != width as usize * height as usize {
            return Err(DemError::InvalidGeoTiff(format!(
                "{} samples do not fill a {}x{} raster",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            bounds,
            no_data_value,
        })
    }

    /// Load a tile from a GeoTIFF file, falling back to the cell's bounds
    /// when the file carries no georeferencing tags.
    pub fn from_file_in_cell<P: AsRef<Path>>(path: P, cell: TileId) -> Result<Self> {
        let file = fs::File::open(path.as_ref())?;
        Self::from_reader(file, Some(cell.bounds()))
    }

    /// Load a raster from a GeoTIFF file that must carry georeferencing tags.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = fs::File::open(path.as_ref())?;
        Self::from_reader(file, None)
    }

    /// Decode a GeoTIFF held in memory.
    pub fn from_bytes(bytes: &[u8], fallback: Option<GeoBounds>) -> Result<Self> {
        Self::from_reader(Cursor::new(bytes), fallback)
    }

    fn from_reader<R: Read + Seek>(reader: R, fallback: Option<GeoBounds>) -> Result<Self> {
        let mut decoder = Self::decoder(reader)?;
        let (width, height) = decoder.dimensions()?;

        let bounds = match Self::read_geotransform(&mut decoder)? {
            Some(bounds) => bounds,
            None => fallback.ok_or_else(|| {
                DemError::InvalidGeoTiff("missing ModelTiepoint/ModelPixelScale tags".to_string())
            })?,
        };

        let data = Self::decode_elevation_data(&mut decoder)?;
        let no_data_value = Self::read_nodata_value(&mut decoder);

        Self::new(data, width, height, bounds, no_data_value)
    }

    fn decoder<R: Read + Seek>(reader: R) -> Result<Decoder<R>> {
        // 1/3 arc-second tiles are 10812 x 10812 f32 pixels, ~466 MB decoded
        const GIB: usize = 1 << 30;
        let mut limits = Limits::default();
        limits.decoding_buffer_size = GIB;
        limits.intermediate_buffer_size = GIB;
        limits.ifd_value_size = GIB;
        Ok(Decoder::new(reader)?.with_limits(limits))
    }

    /// Read the geotransform from ModelTiepoint and ModelPixelScale tags.
    fn read_geotransform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<GeoBounds>> {
        let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag);
        let pixel_scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag);

        let (Ok(tiepoint), Ok(scale)) = (tiepoint, pixel_scale) else {
            return Ok(None);
        };
        if tiepoint.len() < 6 || scale.len() < 2 {
            return Ok(None);
        }

        // Tiepoint format: [i, j, k, x, y, z]; the raster grows south and east.
        // Overlap buffers and pixel-is-point origins reach past the poles and
        // the antimeridian by a fraction of a pixel, so edges are clamped.
        let (width, height) = decoder.dimensions()?;
        let tie_col = tiepoint[0];
        let tie_row = tiepoint[1];
        let west = tiepoint[3] - tie_col * scale[0];
        let north = tiepoint[4] + tie_row * scale[1];
        let east = west + width as f64 * scale[0];
        let south = north - height as f64 * scale[1];

        GeoBounds::clamped(west, south, east, north)
            .map(Some)
            .map_err(|_| {
                DemError::InvalidGeoTiff(format!(
                    "geotransform yields invalid bounds ({west}, {south}, {east}, {north})"
                ))
            })
    }

    /// Read the first band as f32 regardless of the stored sample type.
    fn decode_elevation_data<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Vec<f32>> {
        fn widen<T: Copy + Into<f64>>(samples: Vec<T>) -> Vec<f32> {
            samples.into_iter().map(|v| v.into() as f32).collect()
        }

        Ok(match decoder.read_image()? {
            DecodingResult::F32(samples) => samples,
            DecodingResult::F64(samples) => widen(samples),
            DecodingResult::I8(samples) => widen(samples),
            DecodingResult::I16(samples) => widen(samples),
            DecodingResult::I32(samples) => widen(samples),
            DecodingResult::U8(samples) => widen(samples),
            DecodingResult::U16(samples) => widen(samples),
            DecodingResult::U32(samples) => widen(samples),
            // 64-bit integer elevations do not occur in practice
            DecodingResult::I64(samples) => samples.into_iter().map(|v| v as f32).collect(),
            DecodingResult::U64(samples) => samples.into_iter().map(|v| v as f32).collect(),
        })
    }

    /// Try to read the no-data value from the GDAL_NODATA tag.
    fn read_nodata_value<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f32> {
        decoder
            .get_tag_ascii_string(Tag::GdalNodata)
            .ok()
            .and_then(|s| s.trim_end_matches('\0').trim().parse().ok())
    }

    /// Sample the pixel whose area contains `(lat, lon)`.
    ///
    /// Returns `None` outside the raster or on no-data.
    pub fn sample_nearest(&self, lat: f64, lon: f64) -> Option<f32> {
        if !self.bounds.contains(lat, lon) {
            return None;
        }

        let (scale_x, scale_y) = self.resolution();
        let col = ((lon - self.bounds.west()) / scale_x).floor() as i64;
        let row = ((self.bounds.north() - lat) / scale_y).floor() as i64;
        let col = col.clamp(0, self.width as i64 - 1);
        let row = row.clamp(0, self.height as i64 - 1);

        let value = self.data[row as usize * self.width as usize + col as usize];
        if self.is_nodata(value) {
            None
        } else {
            Some(value)
        }
    }

    fn is_nodata(&self, value: f32) -> bool {
        if !value.is_finite() {
            return true;
        }
        match self.no_data_value {
            Some(nodata) => (value - nodata).abs() < 0.001,
            None => false,
        }
    }

    /// Count samples that carry real elevation values.
    pub fn valid_samples(&self) -> usize {
        self.data.iter().filter(|v| !self.is_nodata(**v)).count()
    }

    /// Raw samples in row-major order.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Outer pixel edges.
    pub fn bounds(&self) -> GeoBounds {
        self.bounds
    }

    /// `(width, height)` in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// The no-data marker, if any.
    pub fn no_data_value(&self) -> Option<f32> {
        self.no_data_value
    }

    /// Degrees per pixel as `(lon, lat)`.
    pub fn resolution(&self) -> (f64, f64) {
        (
            self.bounds.width_deg() / self.width as f64,
            self.bounds.height_deg() / self.height as f64,
        )
    }

    /// Encode as a single-band f32 GeoTIFF.
    pub fn to_geotiff_bytes(&self) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.write_geotiff_to(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Encode as a GeoTIFF into any seekable writer.
    pub fn write_geotiff_to<W: Write + Seek>(&self, writer: W) -> Result<()> {
        let (scale_x, scale_y) = self.resolution();
        let nodata = self.no_data_value.unwrap_or(DEFAULT_NODATA).to_string();

        let mut encoder = TiffEncoder::new(writer)?;
        let mut image = encoder.new_image::<colortype::Gray32Float>(self.width, self.height)?;
        image
            .encoder()
            .write_tag(Tag::ModelPixelScaleTag, &[scale_x, scale_y, 0.0][..])?;
        image.encoder().write_tag(
            Tag::ModelTiepointTag,
            &[0.0, 0.0, 0.0, self.bounds.west(), self.bounds.north(), 0.0][..],
        )?;
        image.encoder().write_tag(Tag::GdalNodata, nodata.as_str())?;
        image.write_data(&self.data)?;
        Ok(())
    }
}

/// Cheap integrity check for a cached tile file.
///
/// The file must open, be at least `min_bytes` long and carry a decodable
/// TIFF header with non-zero dimensions. Pixel data is not decoded.
pub fn check_tile_header<P: AsRef<Path>>(path: P, min_bytes: u64) -> Result<(u32, u32)> {
    let path = path.as_ref();
    let len = fs::metadata(path)?.len();
    if len < min_bytes {
        return Err(DemError::Verification(format!(
            "{} is {} bytes, expected at least {}",
            path.display(),
            len,
            min_bytes
        )));
    }

    let file = fs::File::open(path)?;
    let mut decoder = Decoder::new(file)?;
    let (width, height) = decoder.dimensions()?;
    if width == 0 || height == 0 {
        return Err(DemError::Verification(format!(
            "{} has empty dimensions",
            path.display()
        )));
    }
    Ok((width, height))
}

/// Read a tile's pixel size in degrees as `(lon, lat)` without decoding pixels.
pub(crate) fn probe_pixel_size<P: AsRef<Path>>(path: P, cell: TileId) -> Result<(f64, f64)> {
    let file = fs::File::open(path.as_ref())?;
    let mut decoder = Decoder::new(file)?;
    let (width, height) = decoder.dimensions()?;
    if width == 0 || height == 0 {
        return Err(DemError::InvalidGeoTiff(format!(
            "{} has empty dimensions",
            path.as_ref().display()
        )));
    }
    let bounds = DemTile::read_geotransform(&mut decoder)?.unwrap_or_else(|| cell.bounds());
    Ok((
        bounds.width_deg() / width as f64,
        bounds.height_deg() / height as f64,
    ))
}

/// Full verification of freshly downloaded bytes.
///
/// The whole image is decoded and must contain at least one valid sample.
pub fn verify_raster_bytes(bytes: &[u8], min_bytes: u64, cell: TileId) -> Result<RasterSummary> {
    if (bytes.len() as u64) < min_bytes {
        return Err(DemError::Verification(format!(
            "payload is {} bytes, expected at least {}",
            bytes.len(),
            min_bytes
        )));
    }

    let tile = DemTile::from_bytes(bytes, Some(cell.bounds()))?;
    let valid_samples = tile.valid_samples();
    if valid_samples == 0 {
        return Err(DemError::Verification("raster holds only no-data".to_string()));
    }

    let (width, height) = tile.dimensions();
    Ok(RasterSummary {
        width,
        height,
        valid_samples,
    })
}
