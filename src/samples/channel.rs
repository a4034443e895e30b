use glam::{Vec2, Vec3, Vec4};

use crate::error::{ReconError, ReconResult};
use crate::samples::SampleBuffer;

/// Stable handle to an extra channel. The element type is encoded in the top bits so a
/// mistyped access is detected from the id alone.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId(u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelKind {
    Float = 0 << ChannelId::TAG_SHIFT,
    Int = 1 << ChannelId::TAG_SHIFT,
    Vec2 = 2 << ChannelId::TAG_SHIFT,
    Vec3 = 3 << ChannelId::TAG_SHIFT,
    Vec4 = 4 << ChannelId::TAG_SHIFT,
}

impl ChannelId {
    const TAG_BITS: u32 = 3;
    const TAG_SHIFT: u32 = 32 - Self::TAG_BITS;
    const IDX_MASK: u32 = (1 << Self::TAG_SHIFT) - 1;
    const TAG_MASK: u32 = !Self::IDX_MASK;

    fn new(kind: ChannelKind, idx: usize) -> Self {
        assert!(
            idx <= Self::IDX_MASK as usize,
            "cannot exceed {} channels",
            Self::IDX_MASK
        );
        ChannelId(idx as u32 | kind as u32)
    }

    pub fn kind(self) -> ChannelKind {
        match (self.0 & Self::TAG_MASK) >> Self::TAG_SHIFT {
            0 => ChannelKind::Float,
            1 => ChannelKind::Int,
            2 => ChannelKind::Vec2,
            3 => ChannelKind::Vec3,
            _ => ChannelKind::Vec4,
        }
    }

    fn idx(self) -> usize {
        (self.0 & Self::IDX_MASK) as usize
    }
}

impl ChannelKind {
    pub fn components(self) -> usize {
        match self {
            ChannelKind::Float | ChannelKind::Int => 1,
            ChannelKind::Vec2 => 2,
            ChannelKind::Vec3 => 3,
            ChannelKind::Vec4 => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChannelKind::Float => "float",
            ChannelKind::Int => "int",
            ChannelKind::Vec2 => "vec2",
            ChannelKind::Vec3 => "vec3",
            ChannelKind::Vec4 => "vec4",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "float" => ChannelKind::Float,
            "int" => ChannelKind::Int,
            "vec2" => ChannelKind::Vec2,
            "vec3" => ChannelKind::Vec3,
            "vec4" => ChannelKind::Vec4,
            _ => return None,
        })
    }
}

/// Backing storage of one channel.
#[derive(Clone, Debug)]
pub enum ChannelData {
    Float(Vec<f32>),
    Int(Vec<i32>),
    Vec2(Vec<Vec2>),
    Vec3(Vec<Vec3>),
    Vec4(Vec<Vec4>),
}

impl ChannelData {
    fn zeroed(kind: ChannelKind, len: usize) -> Self {
        match kind {
            ChannelKind::Float => ChannelData::Float(vec![0.0; len]),
            ChannelKind::Int => ChannelData::Int(vec![0; len]),
            ChannelKind::Vec2 => ChannelData::Vec2(vec![Vec2::ZERO; len]),
            ChannelKind::Vec3 => ChannelData::Vec3(vec![Vec3::ZERO; len]),
            ChannelKind::Vec4 => ChannelData::Vec4(vec![Vec4::ZERO; len]),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelData::Float(_) => ChannelKind::Float,
            ChannelData::Int(_) => ChannelKind::Int,
            ChannelData::Vec2(_) => ChannelKind::Vec2,
            ChannelData::Vec3(_) => ChannelKind::Vec3,
            ChannelData::Vec4(_) => ChannelKind::Vec4,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ChannelData::Float(v) => v.len(),
            ChannelData::Int(v) => v.len(),
            ChannelData::Vec2(v) => v.len(),
            ChannelData::Vec3(v) => v.len(),
            ChannelData::Vec4(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the components of element `idx` as floats. Ints travel as their raw bits so
    /// every `i32` survives the trip.
    pub fn read_components(&self, idx: usize, out: &mut [f32]) {
        match self {
            ChannelData::Float(v) => out[0] = v[idx],
            ChannelData::Int(v) => out[0] = f32::from_bits(v[idx] as u32),
            ChannelData::Vec2(v) => out[..2].copy_from_slice(&v[idx].to_array()),
            ChannelData::Vec3(v) => out[..3].copy_from_slice(&v[idx].to_array()),
            ChannelData::Vec4(v) => out[..4].copy_from_slice(&v[idx].to_array()),
        }
    }

    /// Inverse of [`ChannelData::read_components`].
    pub fn write_components(&mut self, idx: usize, values: &[f32]) {
        match self {
            ChannelData::Float(v) => v[idx] = values[0],
            ChannelData::Int(v) => v[idx] = values[0].to_bits() as i32,
            ChannelData::Vec2(v) => v[idx] = Vec2::from_slice(values),
            ChannelData::Vec3(v) => v[idx] = Vec3::from_slice(values),
            ChannelData::Vec4(v) => v[idx] = Vec4::from_slice(values),
        }
    }
}

/// Element types that can back a channel.
pub trait ChannelType: Copy + Default + Send + Sync + 'static {
    const KIND: ChannelKind;

    fn wrap(values: Vec<Self>) -> ChannelData;
    fn slice(data: &ChannelData) -> Option<&[Self]>;
    fn slice_mut(data: &mut ChannelData) -> Option<&mut [Self]>;
}

macro_rules! channel_type {
    ($ty:ty, $variant:ident) => {
        impl ChannelType for $ty {
            const KIND: ChannelKind = ChannelKind::$variant;

            fn wrap(values: Vec<Self>) -> ChannelData {
                ChannelData::$variant(values)
            }

            fn slice(data: &ChannelData) -> Option<&[Self]> {
                match data {
                    ChannelData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn slice_mut(data: &mut ChannelData) -> Option<&mut [Self]> {
                match data {
                    ChannelData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

channel_type!(f32, Float);
channel_type!(i32, Int);
channel_type!(Vec2, Vec2);
channel_type!(Vec3, Vec3);
channel_type!(Vec4, Vec4);

pub(crate) struct Channel {
    pub name: String,
    pub data: ChannelData,
}

impl SampleBuffer {
    /// Registers a typed channel sized to the current sample count. Reserving an existing
    /// name returns its id without touching the backing array.
    pub fn reserve_channel<T: ChannelType>(&mut self, name: &str) -> ReconResult<ChannelId> {
        self.reserve_channel_kind(name, T::KIND)
    }

    pub fn reserve_channel_kind(&mut self, name: &str, kind: ChannelKind) -> ReconResult<ChannelId> {
        if let Some(id) = self.channel_id(name) {
            if id.kind() != kind {
                return Err(ReconError::ChannelType {
                    name: name.to_owned(),
                    expected: kind,
                    found: id.kind(),
                });
            }
            return Ok(id);
        }

        let id = ChannelId::new(kind, self.channels.len());
        self.channels.push(Channel {
            name: name.to_owned(),
            data: ChannelData::zeroed(kind, self.len()),
        });
        Ok(id)
    }

    /// Registers `name` with precomputed contents.
    pub fn insert_channel<T: ChannelType>(
        &mut self,
        name: &str,
        values: Vec<T>,
    ) -> ReconResult<ChannelId> {
        if values.len() != self.len() {
            return Err(ReconError::config(format!(
                "channel `{name}` has {} values for {} samples",
                values.len(),
                self.len()
            )));
        }
        let id = self.reserve_channel::<T>(name)?;
        self.channels[id.idx()].data = T::wrap(values);
        Ok(id)
    }

    pub fn channel_id(&self, name: &str) -> Option<ChannelId> {
        self.channels
            .iter()
            .position(|c| c.name == name)
            .map(|idx| ChannelId::new(self.channels[idx].data.kind(), idx))
    }

    pub fn channel_name(&self, id: ChannelId) -> &str {
        &self.channels[id.idx()].name
    }

    pub fn channel_ids(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels
            .iter()
            .enumerate()
            .map(|(idx, c)| ChannelId::new(c.data.kind(), idx))
    }

    pub fn channel_data(&self, id: ChannelId) -> &ChannelData {
        &self.channels[id.idx()].data
    }

    pub(crate) fn channel_data_mut(&mut self, id: ChannelId) -> &mut ChannelData {
        &mut self.channels[id.idx()].data
    }

    /// Whole-channel view. Panics if `T` does not match the channel type.
    pub fn channel<T: ChannelType>(&self, id: ChannelId) -> &[T] {
        let channel = &self.channels[id.idx()];
        T::slice(&channel.data).unwrap_or_else(|| {
            panic!(
                "channel `{}` holds {:?} data, accessed as {:?}",
                channel.name,
                channel.data.kind(),
                T::KIND
            )
        })
    }

    pub fn channel_mut<T: ChannelType>(&mut self, id: ChannelId) -> &mut [T] {
        let channel = &mut self.channels[id.idx()];
        let found = channel.data.kind();
        match T::slice_mut(&mut channel.data) {
            Some(values) => values,
            None => panic!(
                "channel `{}` holds {found:?} data, accessed as {:?}",
                channel.name,
                T::KIND
            ),
        }
    }

    /// Looks a channel up by name, reporting a missing channel or a type mismatch.
    pub fn named_channel<T: ChannelType>(&self, name: &str) -> ReconResult<&[T]> {
        let id = self
            .channel_id(name)
            .ok_or_else(|| ReconError::config(format!("sample buffer lacks channel `{name}`")))?;
        if id.kind() != T::KIND {
            return Err(ReconError::ChannelType {
                name: name.to_owned(),
                expected: T::KIND,
                found: id.kind(),
            });
        }
        Ok(self.channel(id))
    }

    /// Like [`SampleBuffer::named_channel`], but a missing channel is `None`.
    pub fn optional_channel<T: ChannelType>(&self, name: &str) -> ReconResult<Option<&[T]>> {
        match self.channel_id(name) {
            Some(_) => self.named_channel(name).map(Some),
            None => Ok(None),
        }
    }

    pub fn sample_extra<T: ChannelType>(&self, id: ChannelId, x: u32, y: u32, i: u32) -> T {
        self.channel::<T>(id)[self.index(x, y, i)]
    }

    pub fn set_sample_extra<T: ChannelType>(
        &mut self,
        id: ChannelId,
        x: u32,
        y: u32,
        i: u32,
        value: T,
    ) {
        let idx = self.index(x, y, i);
        self.channel_mut::<T>(id)[idx] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_is_idempotent_and_keeps_storage() {
        let mut buffer = SampleBuffer::new(4, 4, 2);
        let first = buffer.reserve_channel::<Vec3>("N").unwrap();
        let ptr = buffer.channel::<Vec3>(first).as_ptr();
        let second = buffer.reserve_channel::<Vec3>("N").unwrap();
        assert_eq!(first, second);
        assert_eq!(buffer.channel::<Vec3>(second).as_ptr(), ptr);
        assert_eq!(buffer.channel_ids().count(), 1);
    }

    #[test]
    fn channels_match_sample_count() {
        let mut buffer = SampleBuffer::new_irregular(3, 1, &[2, 0, 5]).unwrap();
        let id = buffer.reserve_channel::<f32>("AO").unwrap();
        assert_eq!(buffer.channel::<f32>(id).len(), buffer.len());
    }

    #[test]
    fn mismatched_types_are_reported() {
        let mut buffer = SampleBuffer::new(1, 1, 1);
        buffer.reserve_channel::<f32>("AO").unwrap();
        assert!(matches!(
            buffer.reserve_channel::<Vec3>("AO"),
            Err(ReconError::ChannelType { .. })
        ));
        assert!(buffer.named_channel::<Vec3>("AO").is_err());
        assert!(buffer.named_channel::<f32>("missing").is_err());
    }

    #[test]
    #[should_panic(expected = "accessed as")]
    fn typed_access_is_checked() {
        let mut buffer = SampleBuffer::new(1, 1, 1);
        let id = buffer.reserve_channel::<f32>("AO").unwrap();
        let _ = buffer.channel::<Vec2>(id);
    }

    #[test]
    fn extras_are_indexed_per_sample() {
        let mut buffer = SampleBuffer::new(2, 2, 3);
        let id = buffer.reserve_channel::<i32>("ID").unwrap();
        buffer.set_sample_extra(id, 1, 1, 2, 42);
        assert_eq!(buffer.sample_extra::<i32>(id, 1, 1, 2), 42);
        assert_eq!(buffer.channel::<i32>(id)[buffer.index(1, 1, 2)], 42);
        assert_eq!(buffer.sample_extra::<i32>(id, 0, 1, 2), 0);
        assert_eq!(id.kind(), ChannelKind::Int);
    }
}
