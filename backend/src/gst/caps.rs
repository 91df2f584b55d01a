//! Conversion between GStreamer caps and graph capability descriptors.

use gstreamer as gst;
use osdcast_types::CapsDescriptor;

/// Descriptor of the first structure in `caps`. `None` for empty caps.
pub fn descriptor_from_caps(caps: &gst::CapsRef) -> Option<CapsDescriptor> {
    if caps.is_any() {
        return Some(CapsDescriptor::any());
    }
    let structure = caps.structure(0)?;
    let mut desc = CapsDescriptor::new(structure.name().as_str());

    if let Some(features) = caps.features(0) {
        desc.memory = features
            .iter()
            .find_map(|f| f.as_str().strip_prefix("memory:").map(str::to_string))
            .filter(|m| m != "SystemMemory");
    }
    desc.format = structure.get::<String>("format").ok();
    desc.width = structure
        .get::<i32>("width")
        .ok()
        .and_then(|w| u32::try_from(w).ok());
    desc.height = structure
        .get::<i32>("height")
        .ok()
        .and_then(|h| u32::try_from(h).ok());

    Some(desc)
}

/// Negotiated caps of a pad, falling back to what it could produce.
pub fn pad_descriptor(pad: &gst::Pad) -> Option<CapsDescriptor> {
    use gst::prelude::*;

    let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
    descriptor_from_caps(&caps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use osdcast_types::MediaKind;

    #[test]
    fn test_nvmm_caps() {
        gst::init().unwrap();
        let caps: gst::Caps = "video/x-raw(memory:NVMM), format=NV12, width=1280, height=720"
            .parse()
            .unwrap();
        let desc = descriptor_from_caps(&caps).unwrap();
        assert_eq!(desc.media_type, "video/x-raw");
        assert_eq!(desc.memory.as_deref(), Some("NVMM"));
        assert_eq!(desc.format.as_deref(), Some("NV12"));
        assert_eq!(desc.width, Some(1280));
        assert_eq!(desc.height, Some(720));
    }

    #[test]
    fn test_system_memory_and_audio() {
        gst::init().unwrap();
        let caps: gst::Caps = "audio/x-raw, format=S16LE, rate=48000".parse().unwrap();
        let desc = descriptor_from_caps(&caps).unwrap();
        assert_eq!(desc.kind(), MediaKind::Audio);
        assert!(desc.memory.is_none());
    }

    #[test]
    fn test_any_and_empty() {
        gst::init().unwrap();
        assert!(descriptor_from_caps(&gst::Caps::new_any()).unwrap().is_any());
        assert!(descriptor_from_caps(&gst::Caps::new_empty()).is_none());
    }
}
