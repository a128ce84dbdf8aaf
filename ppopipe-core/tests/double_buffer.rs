use anyhow::Result;
use candle_core::{Device, Tensor};
use ppopipe_core::pipeline::{BatchSlotState, DoubleBufferedBatches};
use ppopipe_core::tensors::ExperienceTensors;

fn batches(count: usize) -> Result<Vec<ExperienceTensors>> {
    (0..count)
        .map(|idx| {
            let values = vec![idx as f32; 4];
            Ok(ExperienceTensors {
                states: Some(Tensor::from_vec(values.clone(), (2, 2), &Device::Cpu)?),
                advantages: Some(Tensor::from_vec(values[..2].to_vec(), 2, &Device::Cpu)?),
                ..Default::default()
            })
        })
        .collect()
}

fn first_value(batch: &ExperienceTensors) -> Result<f32> {
    Ok(batch.advantages.as_ref().unwrap().to_vec1::<f32>()?[0])
}

#[test]
fn cpu_target_passes_batches_through() -> Result<()> {
    let mut pipeline = DoubleBufferedBatches::new(Device::Cpu)?;
    pipeline.set_batches(batches(3)?)?;
    pipeline.start_prefetch(0)?;
    assert_eq!(pipeline.state(0), Some(BatchSlotState::NotPrefetched));
    for idx in 0..pipeline.len() {
        pipeline.prefetch_next(idx)?;
        assert_eq!(first_value(&pipeline.get_batch(idx)?)?, idx as f32);
    }
    Ok(())
}

#[test]
fn prefetched_batches_arrive_in_order() -> Result<()> {
    let mut pipeline = DoubleBufferedBatches::forced(Device::Cpu)?;
    pipeline.set_batches(batches(4)?)?;
    pipeline.start_prefetch(0)?;
    assert_eq!(pipeline.state(0), Some(BatchSlotState::PrefetchInFlight));
    for idx in 0..pipeline.len() {
        pipeline.prefetch_next(idx)?;
        let batch = pipeline.get_batch(idx)?;
        assert_eq!(first_value(&batch)?, idx as f32);
        assert_eq!(pipeline.state(idx), Some(BatchSlotState::Consumed));
        if idx + 1 < pipeline.len() {
            assert_ne!(pipeline.state(idx + 1), Some(BatchSlotState::NotPrefetched));
        }
    }
    pipeline.wait_pending_prefetch()?;
    for idx in 0..pipeline.len() {
        assert_eq!(pipeline.state(idx), Some(BatchSlotState::Consumed));
    }
    Ok(())
}

#[test]
fn only_one_prefetch_is_in_flight() -> Result<()> {
    let mut pipeline = DoubleBufferedBatches::forced(Device::Cpu)?;
    pipeline.set_batches(batches(3)?)?;
    pipeline.start_prefetch(0)?;
    pipeline.start_prefetch(1)?;
    assert_eq!(pipeline.state(0), Some(BatchSlotState::Ready));
    assert_eq!(pipeline.state(1), Some(BatchSlotState::PrefetchInFlight));
    pipeline.wait_pending_prefetch()?;
    assert_eq!(pipeline.state(1), Some(BatchSlotState::Ready));
    Ok(())
}

#[test]
fn unprefetched_batches_copy_on_demand() -> Result<()> {
    let mut pipeline = DoubleBufferedBatches::forced(Device::Cpu)?;
    pipeline.set_batches(batches(3)?)?;
    assert_eq!(first_value(&pipeline.get_batch(2)?)?, 2.);
    assert_eq!(pipeline.state(2), Some(BatchSlotState::Consumed));
    // a consumed batch can still be fetched again
    assert_eq!(first_value(&pipeline.get_batch(2)?)?, 2.);
    // prefetching past the end is a no-op
    pipeline.prefetch_next(2)?;
    assert!(pipeline.get_batch(3).is_err());
    Ok(())
}

#[test]
fn replacing_batches_drains_the_pending_copy() -> Result<()> {
    let mut pipeline = DoubleBufferedBatches::forced(Device::Cpu)?;
    pipeline.set_batches(batches(2)?)?;
    pipeline.start_prefetch(1)?;
    pipeline.set_batches(batches(3)?)?;
    assert_eq!(pipeline.state(1), Some(BatchSlotState::NotPrefetched));
    pipeline.start_prefetch(0)?;
    assert_eq!(first_value(&pipeline.get_batch(0)?)?, 0.);
    Ok(())
}
