use core_analysis::model::{
    AggregateOpModel, AnalysisModel, InputModel, OperatorKindModel, OperatorModel, SourceModel,
};
use core_analysis::param::is_param_valid;
use core_analysis::{build_runtime, HistoRegistry, OperatorKind, WorkerPool};
use core_arena::Arena;

const KB: usize = 1024;

fn source(id: u32, module_index: usize) -> SourceModel {
    SourceModel {
        id,
        event_index: 0,
        module_index,
        filters: vec!["xxxx aaaa xxxx dddd".into()],
        required_completions: 1,
        rng_seed: Some(1234 + id as u64),
    }
}

fn operator(id: u32, inputs: Vec<InputModel>, kind: OperatorKindModel) -> OperatorModel {
    OperatorModel {
        id,
        event_index: 0,
        inputs,
        kind,
    }
}

fn calibration(id: u32, input: u32) -> OperatorModel {
    operator(
        id,
        vec![InputModel::pipe(input)],
        OperatorKindModel::Calibration { unit_min: 0.0, unit_max: 10.0 },
    )
}

struct Arenas {
    dest: Arena,
    scratch: Arena,
    histo: Arena,
}

impl Arenas {
    fn new() -> Arenas {
        Arenas {
            dest: Arena::new(256 * KB),
            scratch: Arena::new(256 * KB),
            histo: Arena::new(256 * KB),
        }
    }

    fn build(&mut self, model: &AnalysisModel, registry: &mut HistoRegistry) -> core_analysis::Runtime {
        build_runtime(model, &mut self.dest, &mut self.scratch, &mut self.histo, registry).unwrap()
    }
}

#[test]
fn rank_sort_scenario() {
    // E (rank 0) feeds Op1 and Op3 (rank 1); Op2 consumes Op1 (rank 2).
    // After the sort the array order respects rank(Op2) > rank(Op1) ==
    // rank(Op3).
    let model = AnalysisModel {
        sources: vec![source(1, 0)],
        operators: vec![
            operator(
                20,
                vec![InputModel::pipe(10)],
                OperatorKindModel::KeepPrevious { keep_valid: false },
            ),
            calibration(10, 1),
            operator(
                30,
                vec![InputModel::pipe(1)],
                OperatorKindModel::Aggregate {
                    op: AggregateOpModel::Sum,
                    threshold_min: None,
                    threshold_max: None,
                },
            ),
        ],
    };

    let mut arenas = Arenas::new();
    let mut registry = HistoRegistry::new();
    let rt = arenas.build(&model, &mut registry);

    let ranks = &rt.ranks[0];
    assert_eq!(ranks.len(), 3);
    assert_eq!(ranks[0], 1);
    assert_eq!(ranks[1], 1);
    assert_eq!(ranks[2], 2);

    // Within rank 1 the kind tag orders calibration before the aggregate.
    assert_eq!(rt.operators[0][0].kind, OperatorKind::Calibration);
    assert_eq!(rt.operators[0][1].kind, OperatorKind::AggregateSum);
    assert_eq!(rt.operators[0][2].kind, OperatorKind::KeepPrevious);

    // Every input producer has a strictly lower rank than its consumer.
    for (i, rank) in ranks.iter().enumerate().skip(1) {
        assert!(ranks[i - 1] <= *rank);
    }
}

#[test]
fn operators_with_unresolved_inputs_drop_transitively() {
    let model = AnalysisModel {
        sources: vec![source(1, 0)],
        operators: vec![
            // References the unknown node 99.
            calibration(10, 99),
            // Depends on the dropped operator 10.
            operator(
                11,
                vec![InputModel::pipe(10)],
                OperatorKindModel::KeepPrevious { keep_valid: false },
            ),
            // Healthy.
            calibration(12, 1),
        ],
    };

    let mut arenas = Arenas::new();
    let mut registry = HistoRegistry::new();
    let rt = arenas.build(&model, &mut registry);

    assert_eq!(rt.operators[0].len(), 1);
    assert_eq!(rt.operators[0][0].kind, OperatorKind::Calibration);
}

#[test]
fn cyclic_references_drop_their_members() {
    let model = AnalysisModel {
        sources: vec![source(1, 0)],
        operators: vec![
            operator(
                10,
                vec![InputModel::pipe(11)],
                OperatorKindModel::KeepPrevious { keep_valid: false },
            ),
            operator(
                11,
                vec![InputModel::pipe(10)],
                OperatorKindModel::KeepPrevious { keep_valid: false },
            ),
            calibration(12, 1),
        ],
    };

    let mut arenas = Arenas::new();
    let mut registry = HistoRegistry::new();
    let rt = arenas.build(&model, &mut registry);

    assert_eq!(rt.operators[0].len(), 1);
}

fn full_chain_model() -> AnalysisModel {
    AnalysisModel {
        sources: vec![source(1, 0)],
        operators: vec![
            calibration(2, 1),
            operator(
                3,
                vec![InputModel::pipe(2)],
                OperatorKindModel::H1DSink { bin_count: 100 },
            ),
        ],
    }
}

#[test]
fn end_to_end_extract_calibrate_histogram() {
    let model = full_chain_model();
    let mut arenas = Arenas::new();
    let mut registry = HistoRegistry::new();
    let mut rt = arenas.build(&model, &mut registry);

    rt.begin_run();

    // One event: module word 0x0108 -> slot 1 value 8 + U[0,1).
    rt.begin_event(0);
    rt.process_module_data(0, 0, &[0x0108]);
    rt.end_event(0);

    // Raw range [0,16) calibrated to [0,10): 8.x maps to ~5.x, i.e. bin
    // 50..56 of 100 bins over [0,10).
    let histos = rt.h1d_histos(0);
    assert_eq!(histos.len(), 16);
    assert_eq!(histos[1].entry_count, 1.0);

    let filled: Vec<usize> = (0..100).filter(|&b| histos[1].data.get(b) > 0.0).collect();
    assert_eq!(filled.len(), 1);
    assert!((50..57).contains(&filled[0]));
}

#[test]
fn histogram_storage_survives_rebuilds() {
    let model = full_chain_model();
    let mut arenas = Arenas::new();
    let mut registry = HistoRegistry::new();

    let mut rt = arenas.build(&model, &mut registry);
    rt.begin_run();
    rt.begin_event(0);
    rt.process_module_data(0, 0, &[0x0108]);
    rt.end_event(0);

    let before: f64 = rt.h1d_histos(0)[1].data.as_slice().iter().sum();
    assert_eq!(before, 1.0);
    let registry_size = registry.len();

    // Rebuild into a fresh run arena, as happens on an analysis edit. The
    // registry hands out the same storage, so contents persist.
    drop(rt);
    let mut dest2 = Arena::new(256 * KB);
    let rt2 = build_runtime(
        &model,
        &mut dest2,
        &mut arenas.scratch,
        &mut arenas.histo,
        &mut registry,
    )
    .unwrap();

    assert_eq!(registry.len(), registry_size);
    let after: f64 = rt2.h1d_histos(0)[1].data.as_slice().iter().sum();
    assert_eq!(after, 1.0);
}

#[test]
fn parallel_and_sequential_stepping_agree_on_bin_counts() {
    // A wider graph: two sources, calibrations, a difference and sinks.
    let model = AnalysisModel {
        sources: vec![source(1, 0), source(2, 1)],
        operators: vec![
            calibration(10, 1),
            calibration(11, 2),
            operator(
                12,
                vec![InputModel::pipe(10), InputModel::pipe(11)],
                OperatorKindModel::Difference,
            ),
            operator(
                13,
                vec![InputModel::pipe(10)],
                OperatorKindModel::H1DSink { bin_count: 50 },
            ),
            operator(
                14,
                vec![InputModel::pipe(12)],
                OperatorKindModel::H1DSink { bin_count: 50 },
            ),
        ],
    };

    let words_a: Vec<u32> = (0..16).map(|i| (i << 8) | (i + 1)).collect();
    let words_b: Vec<u32> = (0..16).map(|i| (i << 8) | (15 - i)).collect();

    let run = |parallel: bool| -> Vec<f64> {
        let mut arenas = Arenas::new();
        let mut registry = HistoRegistry::new();
        let mut rt = arenas.build(&model, &mut registry);
        rt.begin_run();

        let pool = WorkerPool::new(if parallel { 3 } else { 0 });

        for _ in 0..100 {
            rt.begin_event(0);
            rt.process_module_data(0, 0, &words_a);
            rt.process_module_data(0, 1, &words_b);

            if parallel {
                rt.end_event_parallel(0, &pool);
            } else {
                rt.end_event(0);
            }
        }

        rt.h1d_histos(0)
            .iter()
            .flat_map(|h| h.data.as_slice().to_vec())
            .collect()
    };

    // Bin counts are integer fills; they must agree exactly between the
    // two execution modes.
    assert_eq!(run(false), run(true));
}

#[test]
fn duplicate_ids_are_rejected() {
    let model = AnalysisModel {
        sources: vec![source(1, 0), source(1, 1)],
        operators: vec![],
    };

    let mut arenas = Arenas::new();
    let mut registry = HistoRegistry::new();
    let err = build_runtime(
        &model,
        &mut arenas.dest,
        &mut arenas.scratch,
        &mut arenas.histo,
        &mut registry,
    )
    .unwrap_err();

    assert!(matches!(err, core_analysis::AdapterError::DuplicateId(1)));
}

#[test]
fn h2d_sink_uses_slot_indices() {
    let model = AnalysisModel {
        sources: vec![source(1, 0)],
        operators: vec![
            calibration(2, 1),
            operator(
                3,
                vec![InputModel::slot(2, 1), InputModel::slot(2, 2)],
                OperatorKindModel::H2DSink { x_bins: 10, y_bins: 10 },
            ),
        ],
    };

    let mut arenas = Arenas::new();
    let mut registry = HistoRegistry::new();
    let mut rt = arenas.build(&model, &mut registry);

    rt.begin_run();
    rt.begin_event(0);
    // Slot 1 <- 5.x, slot 2 <- 7.x; calibrated from [0,16) to [0,10).
    rt.process_module_data(0, 0, &[0x0105, 0x0207]);
    rt.end_event(0);

    let histos = rt.h2d_histos(0);
    assert_eq!(histos.len(), 1);
    assert_eq!(histos[0].entry_count, 1.0);
    // 5.x * 0.625 lands in x bin 3, 7.x * 0.625 in y bin 4.
    assert_eq!(histos[0].value(3, 4), 1.0);
}

#[test]
fn valid_outputs_stay_inside_their_limits() {
    let model = AnalysisModel {
        sources: vec![source(1, 0), source(2, 1)],
        operators: vec![
            calibration(10, 1),
            calibration(11, 2),
            operator(
                12,
                vec![InputModel::pipe(10), InputModel::pipe(11)],
                OperatorKindModel::Difference,
            ),
            operator(
                13,
                vec![InputModel::pipe(12)],
                OperatorKindModel::Aggregate {
                    op: AggregateOpModel::Multiplicity,
                    threshold_min: None,
                    threshold_max: None,
                },
            ),
        ],
    };

    let mut arenas = Arenas::new();
    let mut registry = HistoRegistry::new();
    let mut rt = arenas.build(&model, &mut registry);

    rt.begin_run();
    rt.begin_event(0);
    let words_a: Vec<u32> = (0..16u32).map(|i| (i << 8) | (i % 16)).collect();
    // Fewer hits on the second module: some difference slots stay invalid.
    let words_b: Vec<u32> = (0..10u32).map(|i| (i << 8) | (i % 16)).collect();
    rt.process_module_data(0, 0, &words_a);
    rt.process_module_data(0, 1, &words_b);
    rt.end_event(0);

    for op in &rt.operators[0] {
        for out in &op.outputs {
            for i in 0..out.len() {
                let v = out.data.get(i);
                if core_analysis::is_param_valid(v) {
                    let lo = out.lower_limits.get(i);
                    let hi = out.upper_limits.get(i);
                    assert!(lo <= v && v < hi, "value {v} outside [{lo}, {hi})");
                }
            }
        }
    }
}
