//! Typed property application on GStreamer elements.

use super::PipelineError;
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use osdcast_types::PropertyValue;
use tracing::debug;

/// Set a stage property on an element, converting the value to the type the
/// element's param spec declares.
pub fn set_property(
    element: &gst::Element,
    stage_name: &str,
    prop_name: &str,
    prop_value: &PropertyValue,
) -> Result<(), PipelineError> {
    debug!(
        "Setting property: {}.{} = {:?}",
        stage_name, prop_name, prop_value
    );

    let invalid = |reason: String| PipelineError::InvalidProperty {
        element: stage_name.to_string(),
        property: prop_name.to_string(),
        reason,
    };

    let pspec = element
        .find_property(prop_name)
        .ok_or_else(|| invalid("no such property".to_string()))?;
    let value_type = pspec.value_type();

    let value: glib::Value = match prop_value {
        PropertyValue::String(v) if value_type == gst::Caps::static_type() => {
            let caps = v
                .parse::<gst::Caps>()
                .map_err(|e| invalid(format!("invalid caps '{}': {}", v, e)))?;
            caps.to_value()
        }
        PropertyValue::String(v) if value_type == glib::Type::STRING => v.to_value(),
        PropertyValue::String(v) => {
            // Enums, flags and numbers given as text
            element.set_property_from_str(prop_name, v);
            return Ok(());
        }
        PropertyValue::Bool(v) => match value_type {
            glib::Type::BOOL => v.to_value(),
            _ => integer_value(value_type, *v as i128).map_err(invalid)?,
        },
        PropertyValue::Int(v) => integer_value(value_type, *v as i128).map_err(invalid)?,
        PropertyValue::UInt(v) => integer_value(value_type, *v as i128).map_err(invalid)?,
    };

    element.set_property_from_value(prop_name, &value);
    Ok(())
}

/// Build a value of `value_type` from an integer, checking the range.
fn integer_value(value_type: glib::Type, v: i128) -> Result<glib::Value, String> {
    let out_of_range = || format!("value {} out of range for {}", v, value_type.name());

    let value = match value_type {
        glib::Type::I32 => i32::try_from(v).map_err(|_| out_of_range())?.to_value(),
        glib::Type::U32 => u32::try_from(v).map_err(|_| out_of_range())?.to_value(),
        glib::Type::I64 => i64::try_from(v).map_err(|_| out_of_range())?.to_value(),
        glib::Type::U64 => u64::try_from(v).map_err(|_| out_of_range())?.to_value(),
        glib::Type::I_LONG => glib::ILong(i64::try_from(v).map_err(|_| out_of_range())? as _)
            .to_value(),
        glib::Type::U_LONG => glib::ULong(u64::try_from(v).map_err(|_| out_of_range())? as _)
            .to_value(),
        glib::Type::BOOL => (v != 0).to_value(),
        t if t.is_a(glib::Type::ENUM) => {
            let class = glib::EnumClass::with_type(t)
                .ok_or_else(|| format!("{} is not an enum", t.name()))?;
            let raw = i32::try_from(v).map_err(|_| out_of_range())?;
            class
                .to_value(raw)
                .ok_or_else(|| format!("{} is not a valid {} value", v, t.name()))?
        }
        t => return Err(format!("cannot set {} from an integer", t.name())),
    };
    Ok(value)
}
