use sqy_core::stage::ensure_capacity;
use sqy_core::{
    ElementType, FromDescriptor, Layout, Result, SqyError, Stage, StageContext, StageDescriptor, StageMeta,
};

/// No-op stage: copies its input verbatim.
///
/// Useful for:
/// - Verifying the stream framing independently of any real stage.
/// - Storing data that is already compressed.
pub struct PassThroughStage;

impl FromDescriptor for PassThroughStage {
    fn from_descriptor(_descriptor: &StageDescriptor) -> Result<Self> {
        Ok(Self)
    }
}

impl Stage for PassThroughStage {
    fn name(&self) -> &'static str {
        "pass_through"
    }

    fn output_element(&self, input: ElementType) -> Result<ElementType> {
        Ok(input)
    }

    fn max_encoded_size(&self, input_len: usize) -> usize {
        input_len
    }

    fn encode(
        &self,
        input: &[u8],
        _layout: &Layout,
        output: &mut [u8],
        _meta: &mut StageMeta,
        _ctx: &StageContext,
    ) -> Result<usize> {
        ensure_capacity(self.name(), input.len(), output.len())?;
        output[..input.len()].copy_from_slice(input);
        Ok(input.len())
    }

    fn decode(
        &self,
        input: &[u8],
        _layout: &Layout,
        _meta: &StageMeta,
        output: &mut [u8],
        _ctx: &StageContext,
    ) -> Result<()> {
        if input.len() != output.len() {
            return Err(SqyError::decode(
                self.name(),
                format!("{} bytes stored, {} expected", input.len(), output.len()),
            ));
        }
        output.copy_from_slice(input);
        Ok(())
    }
}
