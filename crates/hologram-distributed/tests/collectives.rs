mod common;

use common::run_ranks;
use half::{bf16, f16};
use hologram_distributed::backend::local::ERR_OTHER;
use hologram_distributed::{Array, ElementKind, Error};
use num_complex::{Complex32, Complex64};

fn sample(rank: usize, i: usize) -> f32 {
    // positive, spread over several binades
    0.125 + ((i * 37 + rank * 101) % 211) as f32 * 0.0625
}

fn ulp_distance(a: u16, b: u16) -> u16 {
    a.abs_diff(b)
}

#[test]
fn half_precision_sums_stay_within_one_ulp() {
    const LEN: usize = 300;
    let results = run_ranks(2, |r| {
        let halves: Vec<f16> = (0..LEN).map(|i| f16::from_f32(sample(r.rank, i))).collect();
        let brains: Vec<bf16> = (0..LEN).map(|i| bf16::from_f32(sample(r.rank, i))).collect();

        let (h_in, b_in) = (Array::from_slice(&halves), Array::from_slice(&brains));
        let h_out = Array::zeros(ElementKind::Float16, LEN);
        let b_out = Array::zeros(ElementKind::BFloat16, LEN);
        r.world.all_sum(&h_in, &h_out, &r.stream).expect("enqueue f16");
        r.world.all_sum(&b_in, &b_out, &r.stream).expect("enqueue bf16");
        r.stream.synchronize().expect("sums");

        (h_out.to_vec::<f16>().expect("f16"), b_out.to_vec::<bf16>().expect("bf16"))
    });

    for (halves, brains) in &results {
        for i in 0..LEN {
            let h_ref: f32 = (0..2).map(|r| f16::from_f32(sample(r, i)).to_f32()).sum();
            let b_ref: f32 = (0..2).map(|r| bf16::from_f32(sample(r, i)).to_f32()).sum();
            assert!(
                ulp_distance(halves[i].to_bits(), f16::from_f32(h_ref).to_bits()) <= 1,
                "f16 element {i}: {} vs {h_ref}",
                halves[i]
            );
            assert!(
                ulp_distance(brains[i].to_bits(), bf16::from_f32(b_ref).to_bits()) <= 1,
                "bf16 element {i}: {} vs {b_ref}",
                brains[i]
            );
        }
    }
    assert_eq!(results[0], results[1]);
}

/// Each of the `ranks - 1` folds rounds to half precision once.
fn per_step_ulp_bound(ranks: usize) -> u16 {
    ranks.saturating_sub(1).div_ceil(2) as u16
}

#[test]
fn half_precision_sums_over_four_ranks_round_per_step() {
    const RANKS: usize = 4;
    const LEN: usize = 200;
    let results = run_ranks(RANKS, |r| {
        // Element 0 is a large value followed by half-ulp addends, which
        // each tie-round back to the accumulator.
        let halves: Vec<f16> = (0..LEN)
            .map(|i| match (i, r.rank) {
                (0, 0) => f16::from_f32(1024.0),
                (0, _) => f16::from_f32(0.5),
                _ => f16::from_f32(sample(r.rank, i)),
            })
            .collect();
        let brains: Vec<bf16> = (0..LEN)
            .map(|i| match (i, r.rank) {
                (0, 0) => bf16::from_f32(256.0),
                (0, _) => bf16::from_f32(1.0),
                _ => bf16::from_f32(sample(r.rank, i)),
            })
            .collect();

        let (h_in, b_in) = (Array::from_slice(&halves), Array::from_slice(&brains));
        let h_out = Array::zeros(ElementKind::Float16, LEN);
        let b_out = Array::zeros(ElementKind::BFloat16, LEN);
        r.world.all_sum(&h_in, &h_out, &r.stream).expect("enqueue f16");
        r.world.all_sum(&b_in, &b_out, &r.stream).expect("enqueue bf16");
        r.stream.synchronize().expect("sums");
        (
            halves,
            brains,
            h_out.to_vec::<f16>().expect("f16"),
            b_out.to_vec::<bf16>().expect("bf16"),
        )
    });

    let bound = per_step_ulp_bound(RANKS);
    for i in 0..LEN {
        let h_ref: f32 = results.iter().map(|(h, _, _, _)| h[i].to_f32()).sum();
        let b_ref: f32 = results.iter().map(|(_, b, _, _)| b[i].to_f32()).sum();
        for (_, _, halves, brains) in &results {
            let h_dist = ulp_distance(halves[i].to_bits(), f16::from_f32(h_ref).to_bits());
            let b_dist = ulp_distance(brains[i].to_bits(), bf16::from_f32(b_ref).to_bits());
            assert!(h_dist <= bound, "f16 element {i}: {} vs {h_ref} ({h_dist} ulp)", halves[i]);
            assert!(b_dist <= bound, "bf16 element {i}: {} vs {b_ref} ({b_dist} ulp)", brains[i]);
        }
    }

    // Rank-order folding, rounding after every step.
    for (_, _, halves, brains) in &results {
        assert_eq!(halves[0], f16::from_f32(1024.0));
        assert_eq!(brains[0], bf16::from_f32(256.0));
    }
    assert!(results.windows(2).all(|w| w[0].2 == w[1].2 && w[0].3 == w[1].3));
}

#[test]
fn half_precision_max_and_min() {
    let results = run_ranks(3, |r| {
        let values = [
            f16::from_f32(r.rank as f32 - 1.0),
            f16::from_f32(10.0 - r.rank as f32),
        ];
        let input = Array::from_slice(&values);
        let hi = Array::zeros(ElementKind::Float16, 2);
        let lo = Array::zeros(ElementKind::Float16, 2);
        r.world.all_max(&input, &hi, &r.stream).expect("max");
        r.world.all_min(&input, &lo, &r.stream).expect("min");
        r.stream.synchronize().expect("reductions");
        (hi.to_vec::<f16>().expect("hi"), lo.to_vec::<f16>().expect("lo"))
    });
    for (hi, lo) in results {
        assert_eq!(hi, vec![f16::from_f32(1.0), f16::from_f32(10.0)]);
        assert_eq!(lo, vec![f16::from_f32(-1.0), f16::from_f32(8.0)]);
    }
}

#[test]
fn in_place_matches_out_of_place() {
    let results = run_ranks(3, |r| {
        let values: Vec<i32> = (0..16).map(|i| (i * 7 + r.rank as i32 * 3) % 11 - 5).collect();
        let in_place = Array::from_slice(&values);
        let input = Array::from_slice(&values);
        let output = Array::zeros(ElementKind::Int32, values.len());

        r.world.all_max(&in_place, &in_place, &r.stream).expect("in place");
        r.world.all_max(&input, &output, &r.stream).expect("out of place");
        r.stream.synchronize().expect("max");

        (
            in_place.to_vec::<i32>().expect("in place"),
            output.to_vec::<i32>().expect("output"),
            input.to_vec::<i32>().expect("input") == values,
        )
    });
    for (in_place, out_of_place, input_untouched) in results {
        assert_eq!(in_place, out_of_place);
        assert!(input_untouched);
    }
}

#[test]
fn gather_places_blocks_in_rank_order() {
    let results = run_ranks(3, |r| {
        let base = r.rank as u64 * 10;
        let input = Array::from_slice(&[base, base + 1]);
        let output = Array::zeros(ElementKind::UInt64, 2 * r.size);
        r.world.all_gather(&input, &output, &r.stream).expect("enqueue");
        r.stream.synchronize().expect("gather");
        output.to_vec::<u64>().expect("read")
    });
    for out in results {
        assert_eq!(out, vec![0, 1, 10, 11, 20, 21]);
    }
}

#[test]
fn unsupported_kind_is_rejected_before_any_backend_call() {
    let results = run_ranks(2, |r| {
        let before = r.backend.stats();
        let values = [Complex64::new(1.0, 2.0)];
        let input = Array::from_slice(&values);
        let output = Array::zeros(ElementKind::Complex128, 1);

        let reduce = r.world.all_sum(&input, &output, &r.stream);
        let gather = r.world.all_gather(&input, &output, &r.stream);
        let send = r.world.send(&input, 0, &r.stream);
        r.stream.synchronize().expect("nothing enqueued");
        (reduce, gather, send, before, r.backend.stats())
    });
    for (reduce, gather, send, before, after) in results {
        let unsupported = Err(Error::UnsupportedType(ElementKind::Complex128));
        assert_eq!(reduce, unsupported);
        assert_eq!(gather, unsupported);
        assert_eq!(send, unsupported);
        assert_eq!(before, after);
    }
}

#[test]
fn complex_max_and_min_use_lexicographic_order() {
    let results = run_ranks(2, |r| {
        let values = if r.rank == 0 {
            [Complex32::new(1.0, 5.0), Complex32::new(3.0, 0.0)]
        } else {
            [Complex32::new(1.0, 7.0), Complex32::new(2.0, 9.0)]
        };
        let input = Array::from_slice(&values);
        let (hi, lo, sum) = (
            Array::zeros(ElementKind::Complex64, 2),
            Array::zeros(ElementKind::Complex64, 2),
            Array::zeros(ElementKind::Complex64, 2),
        );
        r.world.all_max(&input, &hi, &r.stream).expect("max");
        r.world.all_min(&input, &lo, &r.stream).expect("min");
        r.world.all_sum(&input, &sum, &r.stream).expect("sum");
        r.stream.synchronize().expect("reductions");
        (
            hi.to_vec::<Complex32>().expect("hi"),
            lo.to_vec::<Complex32>().expect("lo"),
            sum.to_vec::<Complex32>().expect("sum"),
        )
    });
    for (hi, lo, sum) in results {
        assert_eq!(hi, vec![Complex32::new(1.0, 7.0), Complex32::new(3.0, 0.0)]);
        assert_eq!(lo, vec![Complex32::new(1.0, 5.0), Complex32::new(2.0, 9.0)]);
        assert_eq!(sum, vec![Complex32::new(2.0, 12.0), Complex32::new(5.0, 9.0)]);
    }
}

#[test]
fn bool_reductions_are_logical() {
    let results = run_ranks(3, |r| {
        let input = Array::from_slice(&[r.rank == 1, false, true]);
        let (sum, max, min) = (
            Array::zeros(ElementKind::Bool, 3),
            Array::zeros(ElementKind::Bool, 3),
            Array::zeros(ElementKind::Bool, 3),
        );
        r.world.all_sum(&input, &sum, &r.stream).expect("sum");
        r.world.all_max(&input, &max, &r.stream).expect("max");
        r.world.all_min(&input, &min, &r.stream).expect("min");
        r.stream.synchronize().expect("reductions");
        (
            sum.to_vec::<bool>().expect("sum"),
            max.to_vec::<bool>().expect("max"),
            min.to_vec::<bool>().expect("min"),
        )
    });
    for (sum, max, min) in results {
        assert_eq!(sum, vec![true, false, true]);
        assert_eq!(max, sum);
        assert_eq!(min, vec![false, false, true]);
    }
}

#[test]
fn send_and_recv_round_trip() {
    let results = run_ranks(2, |r| {
        if r.rank == 0 {
            let outgoing = Array::from_slice(&[1.5f64, -2.5, 4.0]);
            let reply = Array::zeros(ElementKind::Float64, 3);
            r.world.send(&outgoing, 1, &r.stream).expect("send");
            r.world.recv(&reply, 1, &r.stream).expect("recv");
            r.stream.synchronize().expect("exchange");
            reply.to_vec::<f64>().expect("reply")
        } else {
            let incoming = Array::zeros(ElementKind::Float64, 3);
            r.world.recv(&incoming, 0, &r.stream).expect("recv");
            r.stream.synchronize().expect("recv done");
            let doubled: Vec<f64> = incoming.to_vec::<f64>().expect("read").iter().map(|v| v * 2.0).collect();
            let reply = Array::from_slice(&doubled);
            r.world.send(&reply, 0, &r.stream).expect("send");
            r.stream.synchronize().expect("send done");
            doubled
        }
    });
    assert_eq!(results[0], vec![3.0, -5.0, 8.0]);
    assert_eq!(results[1], results[0]);
}

#[test]
fn mismatched_collectives_fail_at_synchronize() {
    let results = run_ranks(2, |r| {
        let buf = Array::from_slice(&[1.0f32, 2.0]);
        if r.rank == 0 {
            r.world.all_sum(&buf, &buf, &r.stream).expect("enqueue");
        } else {
            let gathered = Array::zeros(ElementKind::Float32, 4);
            r.world.all_gather(&buf, &gathered, &r.stream).expect("enqueue");
        }
        // a later operation on the same stream still runs
        let after = Array::zeros(ElementKind::Float32, 2);
        r.world.all_min(&buf, &after, &r.stream).expect("enqueue");
        let first = r.stream.synchronize();
        let second = r.stream.synchronize();
        (first, second, after.to_vec::<f32>().expect("read"))
    });
    assert_eq!(results[0].0, Err(Error::comm("all_reduce", ERR_OTHER)));
    assert_eq!(results[1].0, Err(Error::comm("all_gather", ERR_OTHER)));
    for (_, second, after) in &results {
        assert_eq!(second, &Ok(()));
        assert_eq!(after, &vec![1.0, 2.0]);
    }
}
