pub mod hand_segmentation;
