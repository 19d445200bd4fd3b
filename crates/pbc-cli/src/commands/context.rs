//! `pbc context`: combine input maps into a standardized context map.

use std::path::{Path, PathBuf};

use pbc_core::{
    CombinationRule, ContextRequest, ContextSpec, Normalization, PixelMap, ResamplePolicy, Result,
    build_context,
};

use super::{invalid, parse_list};

pub struct ContextOptions<'a> {
    pub inputs: &'a [PathBuf],
    pub nside: u32,
    pub rule: &'a str,
    pub weights: Option<&'a str>,
    pub aggregate: bool,
    pub clip_sigma: Option<f64>,
    pub mask: Option<&'a Path>,
    pub output: Option<&'a Path>,
}

pub fn run(opts: ContextOptions) -> Result<()> {
    let maps: Vec<PixelMap> = opts
        .inputs
        .iter()
        .map(|p| PixelMap::load(p))
        .collect::<Result<_>>()?;
    let spec = build_spec(&opts)?;

    let mask = match opts.mask {
        Some(path) => {
            let map = PixelMap::load(path)?;
            Some(
                (0..map.len())
                    .map(|p| map.is_valid(p) && map.values()[p] > 0.0)
                    .collect::<Vec<bool>>(),
            )
        }
        None => None,
    };
    let mut request = ContextRequest::new(&maps, &spec);
    if let Some(mask) = &mask {
        request = request.with_mask(mask);
    }
    let context = build_context(&request)?;
    let npix = 12 * (opts.nside as usize).pow(2);

    println!("Context");
    println!("  Inputs:    {}", opts.inputs.len());
    println!("  Rule:      {}", context.rule);
    println!("  Nside:     {}", context.nside);
    println!(
        "  Valid:     {} pixels (f_sky {:.3})",
        context.len(),
        context.len() as f64 / npix as f64
    );
    println!("  Raw:       mean {:.4e}, std {:.4e}", context.raw_mean, context.raw_std);
    println!(
        "  Output:    mean {:+.2e}, variance {:.6}",
        context.mean(),
        context.variance()
    );

    if let Some(path) = opts.output {
        context.to_map()?.save(path)?;
        println!("\nContext map written to {}", path.display());
    }
    Ok(())
}

fn build_spec(opts: &ContextOptions) -> Result<ContextSpec> {
    let n = opts.inputs.len();
    let rule = match opts.rule {
        "weighted_sum" => CombinationRule::WeightedSum {
            weights: match opts.weights {
                Some(w) => parse_list(w)?,
                None => vec![1.0; n],
            },
        },
        "ratio" => CombinationRule::Ratio {
            numerator: 0,
            denominator: 1,
        },
        "masked_difference" => CombinationRule::MaskedDifference {
            minuend: 0,
            subtrahend: 1,
        },
        "leading_mode" => CombinationRule::LeadingMode,
        other => return Err(invalid(format!("unknown rule {other}"))),
    };
    let mut spec = ContextSpec::new(opts.nside, rule);
    if opts.aggregate {
        spec.resample = ResamplePolicy::Aggregate;
    }
    if let Some(sigma) = opts.clip_sigma {
        spec.normalization = Normalization::Clipped { sigma };
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_command_writes_standardized_map() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("hits.json");
        pbc_core::mock::scan_map(8, 16, 1).unwrap().save(&input).unwrap();
        let output = dir.path().join("ctx.json");
        let inputs = [input];

        run(ContextOptions {
            inputs: &inputs,
            nside: 8,
            rule: "weighted_sum",
            weights: None,
            aggregate: false,
            clip_sigma: None,
            mask: None,
            output: Some(&output),
        })
        .unwrap();

        let map = PixelMap::load(&output).unwrap();
        let values = map.valid_values();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        assert!(mean.abs() < 1e-9);
    }

    #[test]
    fn test_ratio_uses_first_two_inputs() {
        let inputs = [PathBuf::from("a"), PathBuf::from("b")];
        let opts = ContextOptions {
            inputs: &inputs,
            nside: 8,
            rule: "ratio",
            weights: None,
            aggregate: true,
            clip_sigma: Some(4.0),
            mask: None,
            output: None,
        };
        let spec = build_spec(&opts).unwrap();
        assert_eq!(
            spec.rule,
            CombinationRule::Ratio {
                numerator: 0,
                denominator: 1
            }
        );
        assert_eq!(spec.resample, ResamplePolicy::Aggregate);
        assert_eq!(spec.normalization, Normalization::Clipped { sigma: 4.0 });
    }
}
